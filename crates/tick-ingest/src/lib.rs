//! # Tick Ingest
//!
//! 업스트림 푸시 서버에서 틱 레코드를 받아오는 수집 계층입니다.
//!
//! - [`codec`]: 길이 접두사 프레임 디코더/인코더
//! - [`notice`]: 인증 단계의 비프레임 안내문 스캐너
//! - [`receiver`]: 하트비트, 유휴 감지, 지수 백오프를 갖춘 재연결 수신기
//! - [`parser`]: `$` 구분 레코드 파서와 정규화

pub mod codec;
pub mod notice;
pub mod parser;
pub mod receiver;

pub use codec::{encode_frame, FrameDecoder, FrameError, RawFrame};
pub use parser::{encode_record, parse_record, ParsedRecord, TickParser};
pub use receiver::{ConnectionState, Receiver, ReceiverError};
pub use tick_core::RejectReason;
