//! 길이 접두사 프레임 코덱.
//!
//! 프레임은 `[length: u32 LE][payload: length 바이트]` 형식입니다.
//! 소켓 읽기 단위와 프레임 경계가 일치하지 않으므로 디코더가 부분 읽기를 누적합니다.

use bytes::Bytes;
use thiserror::Error;

/// 길이 접두사 크기.
pub const LENGTH_PREFIX: usize = 4;

/// 누적 버퍼 압축 판단의 최소 기준 (작은 프레임만 오가는 경우).
const MIN_COMPACT_THRESHOLD: usize = 4 * 1024;

/// 와이어에서 꺼낸 프레임 하나.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// 프레임을 수신한 연결 번호
    pub connection_id: u64,
    /// 프레임 본문
    pub payload: Bytes,
}

impl RawFrame {
    pub fn new(connection_id: u64, payload: Bytes) -> Self {
        Self {
            connection_id,
            payload,
        }
    }

    /// 와이어 상의 선언 길이.
    pub fn length(&self) -> u32 {
        self.payload.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// 프레임 무결성 에러.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// 선언 길이가 최대 크기를 초과
    #[error("프레임 크기 초과: 선언 {declared} 바이트 > 최대 {max} 바이트")]
    TooLarge { declared: u32, max: usize },

    /// EOF 시점에 미완성 프레임이 남음
    #[error("프레임 절단: EOF 시점에 {buffered} 바이트 미완성")]
    Truncated { buffered: usize },
}

/// 프레임 디코더.
///
/// 페이로드는 누적 버퍼에서 프레임으로 한 번만 복사됩니다. 소비된 앞부분이
/// 지금까지 본 가장 큰 프레임의 4배를 넘으면 버퍼를 압축합니다.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    read_pos: usize,
    max_frame_size: usize,
    largest_frame: usize,
    connection_id: u64,
}

impl FrameDecoder {
    /// 새 디코더를 생성합니다.
    pub fn new(max_frame_size: usize, connection_id: u64) -> Self {
        Self {
            buf: Vec::with_capacity(64 * 1024),
            read_pos: 0,
            max_frame_size,
            largest_frame: 0,
            connection_id,
        }
    }

    /// 바이트를 추가하고 완성된 프레임을 반환합니다.
    ///
    /// `TooLarge` 이후 디코더 상태는 정의되지 않으므로 연결을 닫아야 합니다.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<RawFrame>, FrameError> {
        let mut frames = Vec::new();
        self.feed_into(bytes, &mut frames)?;
        Ok(frames)
    }

    /// `feed`와 같지만 호출자의 벡터에 프레임을 추가합니다.
    pub fn feed_into(&mut self, bytes: &[u8], out: &mut Vec<RawFrame>) -> Result<(), FrameError> {
        self.buf.extend_from_slice(bytes);

        loop {
            let available = self.buf.len() - self.read_pos;
            if available < LENGTH_PREFIX {
                break;
            }

            let prefix = &self.buf[self.read_pos..self.read_pos + LENGTH_PREFIX];
            let declared = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
            let len = declared as usize;
            if len > self.max_frame_size {
                return Err(FrameError::TooLarge {
                    declared,
                    max: self.max_frame_size,
                });
            }
            if available < LENGTH_PREFIX + len {
                break;
            }

            let start = self.read_pos + LENGTH_PREFIX;
            let payload = Bytes::copy_from_slice(&self.buf[start..start + len]);
            self.read_pos = start + len;
            self.largest_frame = self.largest_frame.max(LENGTH_PREFIX + len);
            out.push(RawFrame::new(self.connection_id, payload));
        }

        self.compact();
        Ok(())
    }

    /// 미완성 상태로 남은 바이트 수.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.read_pos
    }

    /// 스트림 종료(EOF)를 알립니다. 미완성 프레임이 있으면 `Truncated`.
    pub fn finish(&mut self) -> Result<(), FrameError> {
        let buffered = self.buffered();
        self.buf.clear();
        self.read_pos = 0;
        if buffered > 0 {
            Err(FrameError::Truncated { buffered })
        } else {
            Ok(())
        }
    }

    /// 누적 버퍼의 현재 용량 (테스트, 진단용).
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    fn compact(&mut self) {
        if self.read_pos == 0 {
            return;
        }
        if self.read_pos == self.buf.len() {
            self.buf.clear();
            self.read_pos = 0;
            return;
        }
        let threshold = (self.largest_frame * 4).max(MIN_COMPACT_THRESHOLD);
        if self.read_pos > threshold {
            self.buf.drain(..self.read_pos);
            self.read_pos = 0;
        }
    }
}

/// 페이로드를 와이어 프레임으로 인코딩합니다.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LENGTH_PREFIX + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_single_frame() {
        let mut decoder = FrameDecoder::new(1024, 1);
        let frames = decoder.feed(&encode_frame(b"SH600000$x")).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].payload[..], b"SH600000$x");
        assert_eq!(frames[0].connection_id, 1);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_partial_reads_reassemble() {
        let wire = encode_frame(b"hello world");
        let mut decoder = FrameDecoder::new(1024, 1);

        assert!(decoder.feed(&wire[..2]).unwrap().is_empty());
        assert!(decoder.feed(&wire[2..7]).unwrap().is_empty());
        let frames = decoder.feed(&wire[7..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].payload[..], b"hello world");
    }

    #[test]
    fn test_many_frames_in_one_read() {
        let mut wire = Vec::new();
        for i in 0..10 {
            wire.extend(encode_frame(format!("record-{}", i).as_bytes()));
        }
        let mut decoder = FrameDecoder::new(1024, 1);
        let frames = decoder.feed(&wire).unwrap();
        assert_eq!(frames.len(), 10);
        assert_eq!(&frames[9].payload[..], b"record-9");
    }

    #[test]
    fn test_zero_length_frame() {
        let mut decoder = FrameDecoder::new(1024, 1);
        let frames = decoder.feed(&encode_frame(b"")).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_empty());
    }

    #[test]
    fn test_frame_too_large() {
        let mut decoder = FrameDecoder::new(16, 1);
        let err = decoder.feed(&encode_frame(&[b'x'; 17])).unwrap_err();
        assert_eq!(err, FrameError::TooLarge { declared: 17, max: 16 });
    }

    #[test]
    fn test_exact_max_size_accepted() {
        let mut decoder = FrameDecoder::new(16, 1);
        let frames = decoder.feed(&encode_frame(&[b'x'; 16])).unwrap();
        assert_eq!(frames[0].length(), 16);
    }

    #[test]
    fn test_truncated_only_at_eof() {
        let wire = encode_frame(b"abcdef");
        let mut decoder = FrameDecoder::new(1024, 1);
        assert!(decoder.feed(&wire[..6]).unwrap().is_empty());
        assert_eq!(decoder.finish(), Err(FrameError::Truncated { buffered: 6 }));

        let mut decoder = FrameDecoder::new(1024, 1);
        assert!(decoder.feed(&wire[..3]).unwrap().is_empty());
        assert_eq!(decoder.finish(), Err(FrameError::Truncated { buffered: 3 }));

        let mut decoder = FrameDecoder::new(1024, 1);
        decoder.feed(&wire).unwrap();
        assert_eq!(decoder.finish(), Ok(()));
    }

    #[test]
    fn test_accumulator_compacts() {
        let mut decoder = FrameDecoder::new(1024, 1);
        let frame = encode_frame(&[b'a'; 100]);
        // 항상 1바이트를 남겨 clear 경로를 피한다
        let mut pending = Vec::new();
        for _ in 0..500 {
            pending.extend_from_slice(&frame);
        }
        pending.push(0);
        decoder.feed(&pending).unwrap();
        assert_eq!(decoder.buffered(), 1);
        assert_eq!(decoder.read_pos, 0);
    }

    proptest! {
        #[test]
        fn prop_any_split_yields_same_frames(
            payloads in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 1..20),
            split in 1usize..17,
        ) {
            let mut wire = Vec::new();
            for p in &payloads {
                wire.extend(encode_frame(p));
            }

            let mut decoder = FrameDecoder::new(1024, 7);
            let mut frames = Vec::new();
            for chunk in wire.chunks(split) {
                decoder.feed_into(chunk, &mut frames).unwrap();
            }

            prop_assert_eq!(frames.len(), payloads.len());
            for (frame, payload) in frames.iter().zip(&payloads) {
                prop_assert_eq!(&frame.payload[..], &payload[..]);
            }
            prop_assert!(decoder.finish().is_ok());
        }
    }
}
