//! A주 종목코드 규칙.
//!
//! 정규화된 종목코드는 `^[A-Z]{2}[0-9]{6}$` 형식입니다 (예: `SH600000`, `SZ000001`,
//! `BJ830799`). 앞 두 글자는 시장 접두사입니다.

use serde::{Deserialize, Serialize};
use std::fmt;

/// 시장 구분.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Market {
    /// 상하이 증권거래소
    Sh,
    /// 선전 증권거래소
    Sz,
    /// 베이징 증권거래소
    Bj,
}

impl Market {
    /// 두 글자 접두사를 반환합니다.
    pub fn prefix(&self) -> &'static str {
        match self {
            Market::Sh => "SH",
            Market::Sz => "SZ",
            Market::Bj => "BJ",
        }
    }

    /// 접두사에서 시장을 찾습니다.
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "SH" => Some(Market::Sh),
            "SZ" => Some(Market::Sz),
            "BJ" => Some(Market::Bj),
            _ => None,
        }
    }

    /// 6자리 숫자 코드의 첫 자리로 상장 시장을 추정합니다.
    ///
    /// - `6`, `9`: 상하이 (주권, B주)
    /// - `0`, `2`, `3`: 선전 (주권, B주, 창업판)
    /// - `4`, `8`: 베이징
    pub fn infer_from_code(code: &str) -> Option<Self> {
        match code.as_bytes().first()? {
            b'6' | b'9' => Some(Market::Sh),
            b'0' | b'2' | b'3' => Some(Market::Sz),
            b'4' | b'8' => Some(Market::Bj),
            _ => None,
        }
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// 정규화된 종목코드 형식인지 확인합니다.
pub fn is_valid_symbol(symbol: &str) -> bool {
    let bytes = symbol.as_bytes();
    bytes.len() == 8
        && bytes[..2].iter().all(u8::is_ascii_uppercase)
        && bytes[2..].iter().all(u8::is_ascii_digit)
}

/// 원시 종목코드를 정규화합니다.
///
/// - 소문자 접두사는 대문자로 바꿉니다 (`sh600000` → `SH600000`).
/// - 접두사 없는 6자리 코드는 시장을 추정해 접두사를 붙입니다 (`600000` → `SH600000`).
///
/// 정규화 후에도 형식이 맞지 않으면 `None`을 반환합니다.
pub fn normalize_symbol(raw: &str) -> Option<String> {
    let raw = raw.trim();

    if raw.len() == 6 && raw.bytes().all(|b| b.is_ascii_digit()) {
        let market = Market::infer_from_code(raw)?;
        return Some(format!("{}{}", market.prefix(), raw));
    }

    let upper = raw.to_ascii_uppercase();
    if is_valid_symbol(&upper) {
        Some(upper)
    } else {
        None
    }
}

/// 종목코드의 두 글자 시장 접두사를 반환합니다.
pub fn market_prefix(symbol: &str) -> Option<[u8; 2]> {
    let bytes = symbol.as_bytes();
    if bytes.len() >= 2 {
        Some([bytes[0], bytes[1]])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_symbols() {
        assert!(is_valid_symbol("SH600000"));
        assert!(is_valid_symbol("BJ830799"));
        assert!(!is_valid_symbol("sh600000"));
        assert!(!is_valid_symbol("SH60000"));
        assert!(!is_valid_symbol("SHX00000"));
    }

    #[test]
    fn test_normalize_symbol() {
        assert_eq!(normalize_symbol("sz000001").as_deref(), Some("SZ000001"));
        assert_eq!(normalize_symbol("600519").as_deref(), Some("SH600519"));
        assert_eq!(normalize_symbol("300750").as_deref(), Some("SZ300750"));
        assert_eq!(normalize_symbol("830799").as_deref(), Some("BJ830799"));
        assert_eq!(normalize_symbol("  SH601318 ").as_deref(), Some("SH601318"));
        assert_eq!(normalize_symbol("AAPL"), None);
        assert_eq!(normalize_symbol("123456"), None);
    }

    #[test]
    fn test_market_prefix() {
        assert_eq!(market_prefix("SZ000001"), Some(*b"SZ"));
        assert_eq!(market_prefix("S"), None);
        assert_eq!(Market::from_prefix("BJ"), Some(Market::Bj));
        assert_eq!(Market::Sh.to_string(), "SH");
    }
}
