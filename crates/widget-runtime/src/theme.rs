use std::collections::BTreeMap;

use sbw_core::normalize::FieldAlias;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::css::ValueGrammar;

/// Bumped whenever a variable is renamed or removed.
pub const THEME_VARIABLES_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThemeVariable {
    pub name: &'static str,
    pub grammar: ValueGrammar,
}

pub const PRIMARY_COLOR: &str = "--sbw-primary-color";
pub const BACKGROUND_COLOR: &str = "--sbw-background-color";
pub const TEXT_COLOR: &str = "--sbw-text-color";
pub const BOT_BUBBLE_COLOR: &str = "--sbw-bot-bubble-color";
pub const USER_BUBBLE_COLOR: &str = "--sbw-user-bubble-color";
pub const BORDER_RADIUS: &str = "--sbw-border-radius";
pub const WIDTH: &str = "--sbw-width";
pub const HEIGHT: &str = "--sbw-height";
pub const FONT_FAMILY: &str = "--sbw-font-family";
pub const FONT_SIZE: &str = "--sbw-font-size";

/// The only custom properties the widget ever writes into its root.
pub const THEME_VARIABLES: &[ThemeVariable] = &[
    ThemeVariable { name: PRIMARY_COLOR, grammar: ValueGrammar::Color },
    ThemeVariable { name: BACKGROUND_COLOR, grammar: ValueGrammar::Color },
    ThemeVariable { name: TEXT_COLOR, grammar: ValueGrammar::Color },
    ThemeVariable { name: BOT_BUBBLE_COLOR, grammar: ValueGrammar::Color },
    ThemeVariable { name: USER_BUBBLE_COLOR, grammar: ValueGrammar::Color },
    ThemeVariable { name: BORDER_RADIUS, grammar: ValueGrammar::Length },
    ThemeVariable { name: WIDTH, grammar: ValueGrammar::Length },
    ThemeVariable { name: HEIGHT, grammar: ValueGrammar::Length },
    ThemeVariable { name: FONT_FAMILY, grammar: ValueGrammar::FontFamily },
    ThemeVariable { name: FONT_SIZE, grammar: ValueGrammar::Length },
];

pub fn theme_variable(name: &str) -> Option<&'static ThemeVariable> {
    THEME_VARIABLES.iter().find(|variable| variable.name == name)
}

pub type StyleVariableMap = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Position {
    #[default]
    BottomRight,
    BottomLeft,
}

impl Position {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "bottom-right" | "bottomright" => Some(Position::BottomRight),
            "bottom-left" | "bottomleft" => Some(Position::BottomLeft),
            _ => None,
        }
    }
}

/// Inclusive bounds for a pixel dimension.
#[derive(Debug, Clone, Copy)]
struct Bounds {
    min: u32,
    max: u32,
}

const RADIUS_BOUNDS: Bounds = Bounds { min: 0, max: 32 };
const WIDTH_BOUNDS: Bounds = Bounds { min: 280, max: 640 };
const HEIGHT_BOUNDS: Bounds = Bounds { min: 360, max: 900 };
const FONT_SIZE_BOUNDS: Bounds = Bounds { min: 10, max: 24 };

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThemeConfig {
    pub primary_color: String,
    pub background_color: String,
    pub text_color: String,
    pub bot_bubble_color: String,
    pub user_bubble_color: String,
    pub position: Position,
    pub border_radius: u32,
    pub width: u32,
    pub height: u32,
    pub font_family: String,
    pub font_size: u32,
}

impl Default for ThemeConfig {
    fn default() -> Self {
        Self {
            primary_color: "#6366f1".into(),
            background_color: "#ffffff".into(),
            text_color: "#1f2937".into(),
            bot_bubble_color: "#f3f4f6".into(),
            user_bubble_color: "#6366f1".into(),
            position: Position::BottomRight,
            border_radius: 16,
            width: 380,
            height: 600,
            font_family: "Inter, system-ui, sans-serif".into(),
            font_size: 14,
        }
    }
}

/// Partial, untrusted theme input. Each field is kept as raw JSON so one bad
/// field never poisons the others.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThemeOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_color: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub background_color: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_color: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_bubble_color: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_bubble_color: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub border_radius: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub font_family: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub font_size: Option<Value>,
}

const fn field(canonical: &'static str, aliases: &'static [&'static str]) -> FieldAlias {
    FieldAlias { canonical, aliases }
}

/// Accepted spellings per override, camelCase first.
const OVERRIDE_FIELDS: [FieldAlias; 11] = [
    field("primaryColor", &["primaryColor", "primary_color"]),
    field("backgroundColor", &["backgroundColor", "background_color"]),
    field("textColor", &["textColor", "text_color"]),
    field("botBubbleColor", &["botBubbleColor", "bot_bubble_color"]),
    field("userBubbleColor", &["userBubbleColor", "user_bubble_color"]),
    field("position", &["position"]),
    field("borderRadius", &["borderRadius", "border_radius"]),
    field("width", &["width"]),
    field("height", &["height"]),
    field("fontFamily", &["fontFamily", "font_family"]),
    field("fontSize", &["fontSize", "font_size"]),
];

impl ThemeOverrides {
    /// Reads overrides from arbitrary JSON; anything but an object yields no overrides.
    ///
    /// When both spellings of a field are present the camelCase one wins.
    pub fn from_value(value: &Value) -> Self {
        let Some(object) = value.as_object() else {
            warn!("theme overrides are not an object; ignoring");
            return Self::default();
        };
        let [
            primary_color,
            background_color,
            text_color,
            bot_bubble_color,
            user_bubble_color,
            position,
            border_radius,
            width,
            height,
            font_family,
            font_size,
        ] = OVERRIDE_FIELDS.map(|entry| entry.lookup(object).cloned());
        Self {
            primary_color,
            background_color,
            text_color,
            bot_bubble_color,
            user_bubble_color,
            position,
            border_radius,
            width,
            height,
            font_family,
            font_size,
        }
    }

    /// Per-field merge where `self` wins over `base`.
    pub fn layered_over(&self, base: &ThemeOverrides) -> ThemeOverrides {
        fn pick(top: &Option<Value>, bottom: &Option<Value>) -> Option<Value> {
            top.clone().or_else(|| bottom.clone())
        }
        ThemeOverrides {
            primary_color: pick(&self.primary_color, &base.primary_color),
            background_color: pick(&self.background_color, &base.background_color),
            text_color: pick(&self.text_color, &base.text_color),
            bot_bubble_color: pick(&self.bot_bubble_color, &base.bot_bubble_color),
            user_bubble_color: pick(&self.user_bubble_color, &base.user_bubble_color),
            position: pick(&self.position, &base.position),
            border_radius: pick(&self.border_radius, &base.border_radius),
            width: pick(&self.width, &base.width),
            height: pick(&self.height, &base.height),
            font_family: pick(&self.font_family, &base.font_family),
            font_size: pick(&self.font_size, &base.font_size),
        }
    }
}

impl<'de> Deserialize<'de> for ThemeOverrides {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(Self::from_value(&value))
    }
}

/// A field that failed validation and fell back to its default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThemeFieldError {
    pub field: &'static str,
    pub reason: String,
}

struct Resolver {
    errors: Vec<ThemeFieldError>,
}

impl Resolver {
    fn reject(&mut self, field: &'static str, reason: impl Into<String>) {
        self.errors.push(ThemeFieldError {
            field,
            reason: reason.into(),
        });
    }

    fn color(&mut self, field: &'static str, raw: Option<&Value>, default: String) -> String {
        let Some(raw) = raw else { return default };
        match raw.as_str().map(str::trim) {
            Some(text) if ValueGrammar::Color.accepts(text) => text.to_ascii_lowercase(),
            Some(_) => {
                self.reject(field, "expected a hex color like #1a2b3c");
                default
            }
            None => {
                self.reject(field, "expected a string");
                default
            }
        }
    }

    fn dimension(
        &mut self,
        field: &'static str,
        raw: Option<&Value>,
        bounds: Bounds,
        default: u32,
    ) -> u32 {
        let Some(raw) = raw else { return default };
        let parsed = match raw {
            Value::Number(number) => number
                .as_u64()
                .or_else(|| {
                    number
                        .as_f64()
                        .filter(|value| value.fract() == 0.0 && *value >= 0.0)
                        .map(|value| value as u64)
                })
                .and_then(|value| u32::try_from(value).ok()),
            Value::String(text) => {
                let text = text.trim();
                text.strip_suffix("px")
                    .unwrap_or(text)
                    .trim()
                    .parse::<u32>()
                    .ok()
            }
            _ => None,
        };
        match parsed {
            Some(value) if (bounds.min..=bounds.max).contains(&value) => value,
            Some(value) => {
                self.reject(
                    field,
                    format!("{value} outside {}..={}", bounds.min, bounds.max),
                );
                default
            }
            None => {
                self.reject(field, "expected a non-negative whole number of pixels");
                default
            }
        }
    }

    fn font_family(&mut self, raw: Option<&Value>, default: String) -> String {
        let Some(raw) = raw else { return default };
        match raw.as_str().map(str::trim) {
            Some(text) if ValueGrammar::FontFamily.accepts(text) => text.to_string(),
            _ => {
                self.reject("fontFamily", "unsupported font family");
                default
            }
        }
    }

    fn position(&mut self, raw: Option<&Value>, default: Position) -> Position {
        let Some(raw) = raw else { return default };
        match raw.as_str().and_then(Position::parse) {
            Some(position) => position,
            None => {
                self.reject("position", "expected bottom-right or bottom-left");
                default
            }
        }
    }
}

/// Resolves overrides field-by-field and reports which fields fell back.
pub fn resolve_theme(overrides: Option<&ThemeOverrides>) -> (ThemeConfig, Vec<ThemeFieldError>) {
    let defaults = ThemeConfig::default();
    let Some(o) = overrides else {
        return (defaults, Vec::new());
    };
    let mut r = Resolver { errors: Vec::new() };
    let theme = ThemeConfig {
        primary_color: r.color("primaryColor", o.primary_color.as_ref(), defaults.primary_color),
        background_color: r.color(
            "backgroundColor",
            o.background_color.as_ref(),
            defaults.background_color,
        ),
        text_color: r.color("textColor", o.text_color.as_ref(), defaults.text_color),
        bot_bubble_color: r.color(
            "botBubbleColor",
            o.bot_bubble_color.as_ref(),
            defaults.bot_bubble_color,
        ),
        user_bubble_color: r.color(
            "userBubbleColor",
            o.user_bubble_color.as_ref(),
            defaults.user_bubble_color,
        ),
        position: r.position(o.position.as_ref(), defaults.position),
        border_radius: r.dimension(
            "borderRadius",
            o.border_radius.as_ref(),
            RADIUS_BOUNDS,
            defaults.border_radius,
        ),
        width: r.dimension("width", o.width.as_ref(), WIDTH_BOUNDS, defaults.width),
        height: r.dimension("height", o.height.as_ref(), HEIGHT_BOUNDS, defaults.height),
        font_family: r.font_family(o.font_family.as_ref(), defaults.font_family),
        font_size: r.dimension(
            "fontSize",
            o.font_size.as_ref(),
            FONT_SIZE_BOUNDS,
            defaults.font_size,
        ),
    };
    (theme, r.errors)
}

/// Always returns a complete theme; invalid fields are logged and defaulted.
pub fn get_theme(overrides: Option<&ThemeOverrides>) -> ThemeConfig {
    let (theme, errors) = resolve_theme(overrides);
    for error in &errors {
        warn!(field = error.field, reason = %error.reason, "theme field fell back to default");
    }
    theme
}

/// Pure mapping from a theme to its style variables.
pub fn apply_theme(theme: &ThemeConfig) -> StyleVariableMap {
    let px = |value: u32| format!("{value}px");
    let mut vars = StyleVariableMap::new();
    vars.insert(PRIMARY_COLOR.into(), theme.primary_color.clone());
    vars.insert(BACKGROUND_COLOR.into(), theme.background_color.clone());
    vars.insert(TEXT_COLOR.into(), theme.text_color.clone());
    vars.insert(BOT_BUBBLE_COLOR.into(), theme.bot_bubble_color.clone());
    vars.insert(USER_BUBBLE_COLOR.into(), theme.user_bubble_color.clone());
    vars.insert(BORDER_RADIUS.into(), px(theme.border_radius));
    vars.insert(WIDTH.into(), px(theme.width));
    vars.insert(HEIGHT.into(), px(theme.height));
    vars.insert(FONT_FAMILY.into(), theme.font_family.clone());
    vars.insert(FONT_SIZE.into(), px(theme.font_size));
    vars
}
