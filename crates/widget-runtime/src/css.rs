//! Value grammars for untrusted style input.
//!
//! Merchant configuration is attacker-controlled from the host page's point of
//! view, so every value is matched against a closed grammar before it can
//! reach a stylesheet.

use once_cell::sync::Lazy;
use regex::Regex;

static HEX_COLOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^#(?:[0-9a-fA-F]{3}|[0-9a-fA-F]{4}|[0-9a-fA-F]{6}|[0-9a-fA-F]{8})$")
        .unwrap_or_else(|err| panic!("hex color pattern: {err}"))
});

static PX_LENGTH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:0|[1-9][0-9]{0,3})(?:\.[0-9]{1,2})?px$")
        .unwrap_or_else(|err| panic!("length pattern: {err}"))
});

// Family names separated by commas; quotes allowed, nothing that can close a
// declaration or open a function (`;`, `{`, `}`, `(`, `\`, `<`, `/`).
static FONT_FAMILY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^[A-Za-z0-9 _'"\-]+(?:,[A-Za-z0-9 _'"\-]+)*$"#)
        .unwrap_or_else(|err| panic!("font family pattern: {err}"))
});

pub const MAX_FONT_FAMILY_LEN: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueGrammar {
    Color,
    Length,
    FontFamily,
}

impl ValueGrammar {
    pub fn accepts(self, value: &str) -> bool {
        match self {
            ValueGrammar::Color => HEX_COLOR.is_match(value),
            ValueGrammar::Length => PX_LENGTH.is_match(value),
            ValueGrammar::FontFamily => is_font_family(value),
        }
    }
}

fn is_font_family(value: &str) -> bool {
    if value.is_empty() || value.len() > MAX_FONT_FAMILY_LEN || !FONT_FAMILY.is_match(value) {
        return false;
    }
    value.matches('"').count() % 2 == 0 && value.matches('\'').count() % 2 == 0
}
