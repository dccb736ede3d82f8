//! Match Node
//!
//! A command-line player that:
//! - Joins the relay's matchmaking queue (or an in-process practice hub)
//! - Negotiates a direct peer session with the matched opponent
//! - Plays a small board game over the reliable channel
//! - Streams poses over the unreliable channel
//! - Re-queues after a lost or skipped match (unless `--once`)
//! - Leaves gracefully on SIGINT/SIGTERM

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use peer_session::config::Config;
use peer_session::signaling::loopback::LoopbackHub;
use peer_session::signaling::relay::RelaySignaling;
use peer_session::transport::memory::{MemoryNetwork, MemoryTransportFactory};
use peer_session::transport::quic::QuicTransportFactory;
use peer_session::{
    CoordinatorEvent, Frame, MatchCoordinator, MatchStatus, MessageTable, Role, SessionMetrics,
    SignalingChannel, SignalingError,
};

mod messages;

use messages::GameMsg;

// ============================================================================
// Constants
// ============================================================================

/// Cells on the 3x3 board
const BOARD_CELLS: usize = 9;

/// Rounds played before the Initiator ends the match
const MAX_ROUNDS: u16 = 3;

/// Pose update cadence on the unreliable channel
const POSE_INTERVAL: Duration = Duration::from_millis(100);

/// Heading advance per pose update (degrees)
const POSE_TURN_DEGREES: f32 = 15.0;

/// Radius of the circle the demo pose travels (cells)
const POSE_RADIUS: f32 = 1.5;

/// Poll loop sleep bounds
const MIN_SLEEP: Duration = Duration::from_millis(1);
const MAX_SLEEP: Duration = Duration::from_millis(50);

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();

    // --config <path>      JSON configuration file
    // --relay <url>        Signaling relay WebSocket URL
    // --mode <name>        Matchmaking mode
    // --practice           Play an in-process bot instead of the relay
    // --bind <addr:port>   Local UDP bind address for the QUIC transport
    // --cert <path>        TLS certificate (needed when matched as Responder)
    // --key <path>         TLS private key (needed when matched as Responder)
    // --once               Exit after the first match ends

    let mut config = match parse_arg(&args, "--config") {
        Some(path) => Config::from_file(&path)?,
        None => Config::default(),
    };
    if let Some(url) = parse_arg(&args, "--relay") {
        config.signaling_url = url;
    }
    if let Some(mode) = parse_arg(&args, "--mode") {
        config.mode = mode;
    }
    if let Some(bind) = parse_arg(&args, "--bind") {
        config.transport.bind_addr = bind.parse().map_err(|_| "Invalid bind address")?;
    }
    if let Some(cert) = parse_arg(&args, "--cert") {
        config.transport.cert_path = Some(cert);
    }
    if let Some(key) = parse_arg(&args, "--key") {
        config.transport.key_path = Some(key);
    }
    config.validate()?;

    let practice = has_flag(&args, "--practice");
    let once = has_flag(&args, "--once");

    log::info!("Match node starting...");
    log::info!("  Mode:      {}", config.mode);
    log::info!(
        "  Relay:     {}",
        if practice { "practice (in-process)" } else { config.signaling_url.as_str() }
    );
    log::info!("  Bind:      {}", config.transport.bind_addr);
    log::info!(
        "  Responder: {}",
        if config.transport.cert_path.is_some() { "enabled" } else { "cert missing" }
    );

    let term = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&term))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&term))?;

    let metrics = if practice {
        run_practice(config, once, &term)?
    } else {
        run_relay(config, once, &term)?
    };

    log::info!("Final metrics:\n{}", metrics.render());
    Ok(())
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

// ============================================================================
// Runners
// ============================================================================

/// One player against the relay, QUIC for the direct path
fn run_relay(
    config: Config,
    once: bool,
    term: &AtomicBool,
) -> Result<Arc<SessionMetrics>, Box<dyn std::error::Error>> {
    let signaling = RelaySignaling::connect(&config.signaling_url)?;
    let factory = QuicTransportFactory::new(config.transport.clone());
    let coordinator = MatchCoordinator::new(config, signaling, Box::new(factory));

    let mut players = [Player::new("player", coordinator, messages::table()?, once)];
    drive(&mut players, term)?;

    // dropping the relay sends its close frame
    let [player] = players;
    Ok(player.metrics())
}

/// The player and a bot on an in-process hub and link
fn run_practice(
    config: Config,
    once: bool,
    term: &AtomicBool,
) -> Result<Arc<SessionMetrics>, Box<dyn std::error::Error>> {
    let hub = LoopbackHub::new();
    let net = MemoryNetwork::new();

    let player = MatchCoordinator::new(
        config.clone(),
        hub.endpoint(),
        Box::new(MemoryTransportFactory::new(net.clone())),
    );
    let bot = MatchCoordinator::new(
        config,
        hub.endpoint(),
        Box::new(MemoryTransportFactory::new(net)),
    );

    // the player joins first and so always starts as Initiator
    let mut players = [
        Player::new("player", player, messages::table()?, once),
        Player::new("bot", bot, messages::table()?, once),
    ];
    drive(&mut players, term)?;

    let [player, _bot] = players;
    Ok(player.metrics())
}

/// Poll every player until the first one is done or a signal arrives
fn drive<S: SignalingChannel>(
    players: &mut [Player<S>],
    term: &AtomicBool,
) -> Result<(), Box<dyn std::error::Error>> {
    for player in players.iter_mut() {
        player.start()?;
    }

    while !term.load(Ordering::Relaxed) {
        let now = Instant::now();
        for player in players.iter_mut() {
            match player.poll(now) {
                Ok(()) => {}
                Err(SignalingError::Closed) => {
                    log::warn!("[{}] Relay connection closed", player.name);
                    player.coordinator.leave();
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }

        if players.first().map_or(true, |p| p.done) {
            break;
        }

        let sleep = players
            .iter()
            .filter_map(|p| p.next_timeout(now))
            .min()
            .unwrap_or(MAX_SLEEP)
            .clamp(MIN_SLEEP, MAX_SLEEP);
        std::thread::sleep(sleep);
    }

    if term.load(Ordering::Relaxed) {
        log::info!("Shutdown requested, leaving");
    }
    for player in players.iter_mut() {
        player.coordinator.leave();
    }
    Ok(())
}

// ============================================================================
// Player
// ============================================================================

/// Demo game logic on top of a MatchCoordinator
struct Player<S: SignalingChannel> {
    name: &'static str,
    coordinator: MatchCoordinator<S>,
    codec: MessageTable<GameMsg>,
    once: bool,
    done: bool,
    role: Option<Role>,
    /// Cells taken this round, in play order
    board: Vec<u8>,
    round: u16,
    heading: f32,
    next_pose: Option<Instant>,
}

impl<S: SignalingChannel> Player<S> {
    fn new(
        name: &'static str,
        coordinator: MatchCoordinator<S>,
        codec: MessageTable<GameMsg>,
        once: bool,
    ) -> Self {
        Self {
            name,
            coordinator,
            codec,
            once,
            done: false,
            role: None,
            board: Vec::with_capacity(BOARD_CELLS),
            round: 0,
            heading: 0.0,
            next_pose: None,
        }
    }

    fn metrics(&self) -> Arc<SessionMetrics> {
        Arc::clone(self.coordinator.metrics())
    }

    fn start(&mut self) -> Result<(), SignalingError> {
        self.role = None;
        self.board.clear();
        self.round = 0;
        self.next_pose = None;
        self.coordinator.join_queue(Default::default())
    }

    fn next_timeout(&self, now: Instant) -> Option<Duration> {
        let pose = self.next_pose.map(|at| at.saturating_duration_since(now));
        match (self.coordinator.next_timeout(now), pose) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn poll(&mut self, now: Instant) -> Result<(), SignalingError> {
        self.coordinator.poll(now)?;

        while let Some(event) = self.coordinator.poll_event() {
            self.handle_event(event, now)?;
        }

        if let Some(at) = self.next_pose {
            if now >= at && self.coordinator.status() == MatchStatus::Connected {
                self.send_pose();
                self.next_pose = Some(now + POSE_INTERVAL);
            }
        }
        Ok(())
    }

    fn handle_event(&mut self, event: CoordinatorEvent, now: Instant) -> Result<(), SignalingError> {
        match event {
            CoordinatorEvent::Queued => log::info!("[{}] Waiting for an opponent", self.name),
            CoordinatorEvent::Matched {
                room_id,
                role,
                opponent_ref,
            } => {
                log::info!(
                    "[{}] Matched in {} as {} against {}",
                    self.name,
                    room_id,
                    role,
                    opponent_ref.as_deref().unwrap_or("unknown")
                );
                self.role = Some(role);
                self.board.clear();
                self.round = 0;
            }
            CoordinatorEvent::Established { room_id } => {
                log::info!("[{}] Direct channel up in {}", self.name, room_id);
                self.send(&GameMsg::Ready);
                self.next_pose = Some(now);
            }
            CoordinatorEvent::Unstable => log::warn!("[{}] Connection unstable", self.name),
            CoordinatorEvent::Reconnecting { attempt } => {
                log::warn!("[{}] Reconnecting (attempt {})", self.name, attempt)
            }
            CoordinatorEvent::Restored => log::info!("[{}] Connection restored", self.name),
            CoordinatorEvent::Lost(reason) => {
                log::warn!("[{}] Match lost: {}", self.name, reason);
                self.end_match()?;
            }
            CoordinatorEvent::Skipped => {
                log::info!("[{}] Opponent left the match", self.name);
                self.end_match()?;
            }
            CoordinatorEvent::Message { data, .. } => match self.codec.decode_or_drop(&data) {
                Some(Frame::Message(msg)) => self.handle_message(msg)?,
                Some(Frame::Keepalive) => {}
                None => SessionMetrics::inc(&self.coordinator.metrics().frames_dropped_total),
            },
        }
        Ok(())
    }

    fn handle_message(&mut self, msg: GameMsg) -> Result<(), SignalingError> {
        match msg {
            GameMsg::Ready => {
                log::info!("[{}] Opponent ready", self.name);
                if self.role == Some(Role::Initiator) {
                    self.take_turn();
                }
            }
            GameMsg::Select { cell } => {
                log::debug!("[{}] Opponent selected cell {}", self.name, cell);
                if !self.board.contains(&cell) {
                    self.board.push(cell);
                }
                if self.board.len() >= BOARD_CELLS {
                    self.finish_round()?;
                } else {
                    self.take_turn();
                }
            }
            GameMsg::Score { player, points } => {
                log::info!("[{}] Score: player {} has {} point(s)", self.name, player, points)
            }
            GameMsg::Reset => {
                self.board.clear();
                self.round += 1;
                if self.role != Some(Role::Initiator) {
                    return Ok(());
                }
                if self.round >= MAX_ROUNDS {
                    return self.conclude();
                }
                log::info!("[{}] Round {} begins", self.name, self.round + 1);
                self.take_turn();
            }
            GameMsg::Pose { x, y, heading } => {
                log::trace!("[{}] Opponent pose ({:.2}, {:.2}) @ {:.2}°", self.name, x, y, heading)
            }
            GameMsg::Markers { round, cells } => {
                log::debug!("[{}] Round {} markers: {:?}", self.name, round + 1, cells)
            }
        }
        Ok(())
    }

    /// Select the lowest free cell
    fn take_turn(&mut self) {
        let Some(cell) = (0..BOARD_CELLS as u8).find(|c| !self.board.contains(c)) else {
            return;
        };
        self.board.push(cell);
        self.send(&GameMsg::Select { cell });
    }

    /// Board full: publish markers and score, then reset or end the match
    fn finish_round(&mut self) -> Result<(), SignalingError> {
        let cells = self.board.iter().map(|&c| (c / 3, c % 3)).collect();
        self.send(&GameMsg::Markers {
            round: self.round,
            cells,
        });
        let player = match self.role {
            Some(Role::Initiator) => 0,
            _ => 1,
        };
        self.send(&GameMsg::Score {
            player,
            points: self.round + 1,
        });

        self.board.clear();
        self.round += 1;

        if self.round >= MAX_ROUNDS && self.role == Some(Role::Initiator) {
            return self.conclude();
        }

        self.send(&GameMsg::Reset);
        if self.role == Some(Role::Initiator) {
            self.take_turn();
        }
        Ok(())
    }

    /// Initiator only: leave the room once every round is played
    fn conclude(&mut self) -> Result<(), SignalingError> {
        log::info!("[{}] Played {} rounds, ending the match", self.name, self.round);
        self.coordinator.skip()?;
        self.end_match()
    }

    fn end_match(&mut self) -> Result<(), SignalingError> {
        self.next_pose = None;
        if self.once {
            self.done = true;
            return Ok(());
        }
        self.start()
    }

    fn send_pose(&mut self) {
        self.heading = (self.heading + POSE_TURN_DEGREES) % 360.0;
        let radians = self.heading.to_radians();
        self.send(&GameMsg::Pose {
            x: POSE_RADIUS * radians.cos(),
            y: POSE_RADIUS * radians.sin(),
            heading: self.heading,
        });
    }

    fn send(&mut self, msg: &GameMsg) {
        let frame = match self.codec.encode(msg) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("[{}] Failed to encode {:?}: {}", self.name, msg, e);
                return;
            }
        };
        if !self.coordinator.send(&frame, msg.is_reliable()) {
            log::debug!("[{}] No open channel for {:?}", self.name, msg);
        }
    }
}
