//! Demo message table
//!
//! A small board game: players take turns selecting cells, scores and
//! markers travel on the reliable channel, poses stream on the unreliable
//! one.
//!
//! | Tag  | Message | Payload                                  |
//! |------|---------|------------------------------------------|
//! | 0x01 | Ready   | (empty)                                  |
//! | 0x02 | Select  | cell: u8                                 |
//! | 0x03 | Score   | player: u8, points: u16                  |
//! | 0x04 | Reset   | (empty)                                  |
//! | 0x05 | Pose    | x: i16, y: i16 (÷100), heading: u16 (÷100°) |
//! | 0x06 | Markers | round: u16, count: u8, count × (row, col) |

use peer_session::codec::{
    dequantize_angle, dequantize_i16, quantize_angle, quantize_i16, CodecError, FrameReader,
    FrameWriter, MessageTable, PayloadLayout, WireMessage,
};

const READY: u8 = 0x01;
const SELECT: u8 = 0x02;
const SCORE: u8 = 0x03;
const RESET: u8 = 0x04;
const POSE: u8 = 0x05;
const MARKERS: u8 = 0x06;

/// Board positions in hundredths of a cell
pub const POSITION_SCALE: f32 = 100.0;

#[derive(Debug, Clone, PartialEq)]
pub enum GameMsg {
    Ready,
    Select { cell: u8 },
    Score { player: u8, points: u16 },
    Reset,
    Pose { x: f32, y: f32, heading: f32 },
    Markers { round: u16, cells: Vec<(u8, u8)> },
}

impl GameMsg {
    /// Ordered game events go reliable, continuous state does not
    pub fn is_reliable(&self) -> bool {
        !matches!(self, GameMsg::Pose { .. })
    }
}

impl WireMessage for GameMsg {
    fn type_tag(&self) -> u8 {
        match self {
            GameMsg::Ready => READY,
            GameMsg::Select { .. } => SELECT,
            GameMsg::Score { .. } => SCORE,
            GameMsg::Reset => RESET,
            GameMsg::Pose { .. } => POSE,
            GameMsg::Markers { .. } => MARKERS,
        }
    }

    fn write_payload(&self, w: &mut FrameWriter) -> Result<(), CodecError> {
        match self {
            GameMsg::Ready | GameMsg::Reset => {}
            GameMsg::Select { cell } => w.put_u8(*cell),
            GameMsg::Score { player, points } => {
                w.put_u8(*player);
                w.put_u16(*points);
            }
            GameMsg::Pose { x, y, heading } => {
                w.put_i16(quantize_i16(*x, POSITION_SCALE)?);
                w.put_i16(quantize_i16(*y, POSITION_SCALE)?);
                w.put_u16(quantize_angle(*heading)?);
            }
            GameMsg::Markers { round, cells } => {
                w.put_u16(*round);
                w.put_count(cells.len())?;
                for &(row, col) in cells {
                    w.put_u8(row);
                    w.put_u8(col);
                }
            }
        }
        Ok(())
    }
}

fn decode_ready(_: &mut FrameReader<'_>) -> Result<GameMsg, CodecError> {
    Ok(GameMsg::Ready)
}

fn decode_select(r: &mut FrameReader<'_>) -> Result<GameMsg, CodecError> {
    Ok(GameMsg::Select { cell: r.u8()? })
}

fn decode_score(r: &mut FrameReader<'_>) -> Result<GameMsg, CodecError> {
    Ok(GameMsg::Score {
        player: r.u8()?,
        points: r.u16()?,
    })
}

fn decode_reset(_: &mut FrameReader<'_>) -> Result<GameMsg, CodecError> {
    Ok(GameMsg::Reset)
}

fn decode_pose(r: &mut FrameReader<'_>) -> Result<GameMsg, CodecError> {
    Ok(GameMsg::Pose {
        x: dequantize_i16(r.i16()?, POSITION_SCALE),
        y: dequantize_i16(r.i16()?, POSITION_SCALE),
        heading: dequantize_angle(r.u16()?),
    })
}

fn decode_markers(r: &mut FrameReader<'_>) -> Result<GameMsg, CodecError> {
    let round = r.u16()?;
    let count = r.count()?;
    let mut cells = Vec::with_capacity(count);
    for _ in 0..count {
        cells.push((r.u8()?, r.u8()?));
    }
    Ok(GameMsg::Markers { round, cells })
}

pub fn table() -> Result<MessageTable<GameMsg>, CodecError> {
    MessageTable::new()
        .register(READY, PayloadLayout::EMPTY, decode_ready)?
        .register(SELECT, PayloadLayout::Fixed(1), decode_select)?
        .register(SCORE, PayloadLayout::Fixed(3), decode_score)?
        .register(RESET, PayloadLayout::EMPTY, decode_reset)?
        .register(POSE, PayloadLayout::Fixed(6), decode_pose)?
        .register(
            MARKERS,
            PayloadLayout::Counted {
                prefix: 2,
                element: 2,
            },
            decode_markers,
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use peer_session::Frame;

    #[test]
    fn test_table_registers_every_tag() {
        let table = table().unwrap();
        for tag in [READY, SELECT, SCORE, RESET, POSE, MARKERS] {
            assert!(table.contains(tag));
        }
        assert!(!table.contains(0x07));
    }

    #[test]
    fn test_score_layout() {
        let table = table().unwrap();
        let frame = table
            .encode(&GameMsg::Score {
                player: 1,
                points: 300,
            })
            .unwrap();
        assert_eq!(frame, vec![SCORE, 1, 0x01, 0x2C]);
    }

    #[test]
    fn test_pose_is_quantized() {
        let table = table().unwrap();
        let frame = table
            .encode(&GameMsg::Pose {
                x: 1.234,
                y: -0.5,
                heading: -90.0,
            })
            .unwrap();
        assert_eq!(frame.len(), 7);

        match table.decode(&frame).unwrap() {
            Frame::Message(GameMsg::Pose { x, y, heading }) => {
                assert!((x - 1.23).abs() < 1e-4);
                assert!((y + 0.5).abs() < 1e-4);
                assert!((heading - 270.0).abs() < 1e-3);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_pose_out_of_range_is_rejected() {
        let table = table().unwrap();
        assert!(table
            .encode(&GameMsg::Pose {
                x: 400.0,
                y: 0.0,
                heading: 0.0,
            })
            .is_err());
    }

    #[test]
    fn test_markers_round_trip_and_truncation() {
        let table = table().unwrap();
        let msg = GameMsg::Markers {
            round: 3,
            cells: vec![(0, 1), (2, 2)],
        };
        let frame = table.encode(&msg).unwrap();
        assert_eq!(table.decode(&frame).unwrap(), Frame::Message(msg));
        assert!(table.decode_or_drop(&frame[..frame.len() - 1]).is_none());
    }

    #[test]
    fn test_only_pose_is_unreliable() {
        assert!(GameMsg::Ready.is_reliable());
        assert!(!GameMsg::Pose {
            x: 0.0,
            y: 0.0,
            heading: 0.0
        }
        .is_reliable());
    }
}
