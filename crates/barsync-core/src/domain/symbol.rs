use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::ValidationError;

const MAX_SYMBOL_LEN: usize = 24;
const SEPARATORS: [char; 3] = ['.', '-', '/'];

/// Upper-cased instrument reference as the feed resolves it.
///
/// Plain tickers (`AAPL`), share classes (`BRK.B`), qualified contracts
/// (`ES-FUT`) and pairs (`EUR/USD`) are accepted. `@` never appears in a
/// symbol so `SYMBOL@granularity` keys split unambiguously.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Symbol(String);

impl Symbol {
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let normalized = input.trim().to_ascii_uppercase();
        let mut chars = normalized.chars().enumerate().peekable();

        match chars.peek() {
            None => return Err(ValidationError::EmptySymbol),
            Some(&(_, first)) if !first.is_ascii_alphabetic() => {
                return Err(ValidationError::SymbolInvalidStart { ch: first });
            }
            Some(_) => {}
        }

        let mut len = 0;
        let mut last = ' ';
        for (index, ch) in chars {
            if !(ch.is_ascii_alphanumeric() || SEPARATORS.contains(&ch)) {
                return Err(ValidationError::SymbolInvalidChar { ch, index });
            }
            len = index + 1;
            last = ch;
        }
        if len > MAX_SYMBOL_LEN {
            return Err(ValidationError::SymbolTooLong {
                len,
                max: MAX_SYMBOL_LEN,
            });
        }
        if SEPARATORS.contains(&last) {
            return Err(ValidationError::SymbolInvalidChar {
                ch: last,
                index: len - 1,
            });
        }

        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Ticker before any class, contract or pair qualifier (`BRK.B` -> `BRK`).
    pub fn root(&self) -> &str {
        self.0
            .split(|ch| SEPARATORS.contains(&ch))
            .next()
            .unwrap_or(&self.0)
    }
}

impl Display for Symbol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Symbol {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Symbol> for String {
    fn from(value: Symbol) -> Self {
        value.0
    }
}
