//! Doc-comment attributes attached to declarations.
//!
//! Native bindings and a few lowering hints are written as special line
//! comments above a declaration:
//!
//! ```text
//! /**
//!  * Scroll a number on the screen.
//!  */
//! //% shim=basic::showNumber async
//! //% imageLiteral helper=arrayPush
//! ```
//!
//! Every `//%` line holds space-separated `key=value` pairs (values may be
//! double-quoted) or bare flags. All other comment text becomes help text.

use std::sync::OnceLock;

use regex::Regex;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attrs {
    /// Name of the native primitive implementing this declaration.
    pub shim: Option<String>,
    /// Name of the native enum value (or zero-argument function) of an enum member.
    pub enum_val: Option<String>,
    /// Library helper that implements a method.
    pub helper: Option<String>,
    pub is_async: bool,
    /// The first argument is a string literal to be encoded as an image.
    pub image_literal: bool,
    pub help: Option<String>,
}

fn attr_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"([A-Za-z_][\w.]*)(?:=(?:"([^"]*)"|(\S+)))?"#).expect("static pattern")
    })
}

fn truthy(value: Option<&str>) -> bool {
    !matches!(value, Some("false") | Some("0"))
}

impl Attrs {
    /// Parse the comment block preceding a declaration.
    pub fn parse(comment: &str) -> Self {
        let mut attrs = Attrs::default();
        let mut help = Vec::new();

        for line in comment.lines() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("//%") {
                for cap in attr_pattern().captures_iter(rest) {
                    let key = &cap[1];
                    let value = cap.get(2).or_else(|| cap.get(3)).map(|m| m.as_str());
                    attrs.set(key, value);
                }
                continue;
            }
            let text = line
                .trim_start_matches("/**")
                .trim_end_matches("*/")
                .trim_start_matches("///")
                .trim_start_matches("//")
                .trim_start_matches('*')
                .trim();
            if !text.is_empty() {
                help.push(text);
            }
        }

        if !help.is_empty() {
            attrs.help = Some(help.join(" "));
        }
        attrs
    }

    fn set(&mut self, key: &str, value: Option<&str>) {
        match key {
            "shim" => self.shim = value.map(str::to_string),
            "enumval" => self.enum_val = value.map(str::to_string),
            "helper" => self.helper = value.map(str::to_string),
            "async" => self.is_async = truthy(value),
            "imageLiteral" => self.image_literal = truthy(value),
            // Block-editor attributes are carried by the comments but have no
            // meaning for code generation.
            _ => {}
        }
    }

    pub fn with_shim(mut self, shim: impl Into<String>) -> Self {
        self.shim = Some(shim.into());
        self
    }

    pub fn with_async(mut self) -> Self {
        self.is_async = true;
        self
    }

    pub fn with_helper(mut self, helper: impl Into<String>) -> Self {
        self.helper = Some(helper.into());
        self
    }

    pub fn with_enum_val(mut self, name: impl Into<String>) -> Self {
        self.enum_val = Some(name.into());
        self
    }

    pub fn with_image_literal(mut self) -> Self {
        self.image_literal = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_shim_and_flags() {
        let attrs = Attrs::parse("//% shim=basic::showNumber async\n//% imageLiteral");
        assert_eq!(attrs.shim.as_deref(), Some("basic::showNumber"));
        assert!(attrs.is_async);
        assert!(attrs.image_literal);
        assert!(attrs.help.is_none());
    }

    #[test]
    fn parses_quoted_values_and_ignores_ui_keys() {
        let attrs = Attrs::parse(r#"//% block="show number %n" helper=arrayPush weight=90"#);
        assert_eq!(attrs.helper.as_deref(), Some("arrayPush"));
        assert!(attrs.shim.is_none());
    }

    #[test]
    fn explicit_false_flags() {
        let attrs = Attrs::parse("//% async=false enumval=Button::A");
        assert!(!attrs.is_async);
        assert_eq!(attrs.enum_val.as_deref(), Some("Button::A"));
    }

    #[test]
    fn collects_help_text() {
        let attrs = Attrs::parse(
            "/**\n * Scroll a number on the screen.\n * @param n the number\n */\n//% shim=basic::showNumber",
        );
        assert_eq!(
            attrs.help.as_deref(),
            Some("Scroll a number on the screen. @param n the number")
        );
        assert_eq!(attrs.shim.as_deref(), Some("basic::showNumber"));
    }

    #[test]
    fn builder_helpers() {
        let attrs = Attrs::default().with_shim("led::plot").with_async();
        assert_eq!(attrs.shim.as_deref(), Some("led::plot"));
        assert!(attrs.is_async);
    }
}
