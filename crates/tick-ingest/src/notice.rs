//! 인증 단계의 비프레임 안내문 처리.
//!
//! 서버는 첫 프레임 이전에 줄바꿈으로 끝나는 텍스트 안내문을 보낼 수 있습니다.
//! 4바이트 LE 접두사가 `max_frame_size` 이하인 위치에서 프레임 모드가 시작됩니다.
//! ASCII/UTF-8 텍스트의 첫 4바이트는 항상 0x20202020 이상이므로 10 MiB 상한과 겹치지 않습니다.
//! 4바이트보다 짧은 안내문(`ok\n` 등)은 줄바꿈이 먼저 나오므로 접두사로 해석하지 않습니다.

use crate::codec::LENGTH_PREFIX;

/// 안내문 스캔 결과.
#[derive(Debug, PartialEq, Eq)]
pub enum NoticeOutcome {
    /// 더 많은 바이트가 필요
    Pending,
    /// 인증 거부 안내문
    Rejected(String),
    /// 프레임 모드 시작. 남은 바이트를 디코더에 넘겨야 함
    Framed(Vec<u8>),
    /// 안내문 허용 크기 초과
    Overflow { consumed: usize },
}

/// 인증 단계 안내문 스캐너.
#[derive(Debug)]
pub struct NoticeScanner {
    pending: Vec<u8>,
    consumed: usize,
    window: usize,
    max_frame_size: usize,
    notices: Vec<String>,
}

impl NoticeScanner {
    pub fn new(window: usize, max_frame_size: usize) -> Self {
        Self {
            pending: Vec::new(),
            consumed: 0,
            window,
            max_frame_size,
            notices: Vec::new(),
        }
    }

    /// 지금까지 받은 (거부가 아닌) 안내문.
    pub fn notices(&self) -> &[String] {
        &self.notices
    }

    /// 바이트를 추가하고 스캔합니다.
    pub fn push(&mut self, bytes: &[u8]) -> NoticeOutcome {
        self.pending.extend_from_slice(bytes);

        loop {
            if self.pending.len() >= LENGTH_PREFIX && self.looks_framed() {
                return NoticeOutcome::Framed(std::mem::take(&mut self.pending));
            }

            let newline = self.pending.iter().position(|&b| b == b'\n');
            if self.pending.len() < LENGTH_PREFIX {
                // 짧은 조각은 길이 접두사의 일부일 수 있다
                let is_short_line =
                    matches!(newline, Some(nl) if nl > 0 && !self.pending[..nl].contains(&0));
                if !is_short_line {
                    return NoticeOutcome::Pending;
                }
            }

            match newline {
                Some(newline) => {
                    let line: Vec<u8> = self.pending.drain(..=newline).collect();
                    self.consumed += line.len();
                    let text = String::from_utf8_lossy(&line).trim().to_string();
                    if is_rejection(&text) {
                        return NoticeOutcome::Rejected(text);
                    }
                    if !text.is_empty() {
                        self.notices.push(text);
                    }
                    if self.consumed > self.window {
                        return NoticeOutcome::Overflow {
                            consumed: self.consumed,
                        };
                    }
                }
                None => {
                    if self.consumed + self.pending.len() > self.window {
                        // 줄바꿈 없이 잘린 거부 문구도 잡는다
                        let text = String::from_utf8_lossy(&self.pending).to_string();
                        if is_rejection(&text) {
                            return NoticeOutcome::Rejected(text.trim().to_string());
                        }
                        return NoticeOutcome::Overflow {
                            consumed: self.consumed + self.pending.len(),
                        };
                    }
                    return NoticeOutcome::Pending;
                }
            }
        }
    }

    /// 연결이 끊겼을 때 줄바꿈 없이 남은 텍스트가 거부 문구인지 확인합니다.
    pub fn finish(&mut self) -> Option<String> {
        let text = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        is_rejection(&text).then_some(text)
    }

    fn looks_framed(&self) -> bool {
        if self.short_line_ahead() {
            return false;
        }
        let declared = u32::from_le_bytes([
            self.pending[0],
            self.pending[1],
            self.pending[2],
            self.pending[3],
        ]);
        (declared as usize) <= self.max_frame_size
    }

    /// 첫 4바이트 안에 텍스트 한 줄이 끝나는지.
    fn short_line_ahead(&self) -> bool {
        let head = &self.pending[..LENGTH_PREFIX];
        match head.iter().position(|&b| b == b'\n') {
            Some(newline) if newline > 0 => head[..newline].iter().all(|&b| b >= 0x20),
            _ => false,
        }
    }
}

/// 인증 거부 문구인지 확인합니다 (`失败`, 대소문자 무시 `fail`).
pub fn is_rejection(text: &str) -> bool {
    text.contains("失败") || text.to_ascii_lowercase().contains("fail")
}

/// 길이 접두사 프레임으로 도착한 거부 문구를 꺼냅니다.
///
/// `$` 구분자가 있는 페이로드는 레코드로 보고 거부로 취급하지 않습니다.
pub fn framed_rejection(payload: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(payload).ok()?.trim();
    (!text.contains('$') && is_rejection(text)).then(|| text.to_string())
}
