// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Compiles a subscriber-supplied pattern and matches it against topics.
//!
//! Matching is full-string: a pattern must match a topic in its
//! entirety, so the user-supplied expression is implicitly anchored
//! with `^` and `$` before compilation.

use regex::Regex;

use crate::error::{Error, Result};

/// A compiled, immutable subscription pattern.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    anchored: Regex,
}

impl Pattern {
    /// Compiles `source`. Fails with `Error::PatternError` if the
    /// expression is malformed.
    pub fn compile(source: &str) -> Result<Pattern> {
        let anchored = Regex::new(&format!("^(?:{})$", source))
            .map_err(|e| Error::PatternError(e.to_string()))?;

        Ok(Pattern {
            source: source.to_owned(),
            anchored,
        })
    }

    /// True iff `topic` fully matches this pattern.
    pub fn matches(&self, topic: &str) -> bool {
        self.anchored.is_match(topic)
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_literal_matches_only_itself() {
        let p = Pattern::compile(r"chat\.en").unwrap();
        assert!(p.matches("chat.en"));
        assert!(!p.matches("chat.en2"));
        assert!(!p.matches("xchat.en"));
    }

    #[test]
    fn group_alternation_matches_each_branch() {
        let p = Pattern::compile(r"chat\.(en|de)").unwrap();
        assert!(p.matches("chat.en"));
        assert!(p.matches("chat.de"));
        assert!(!p.matches("chat.fr"));
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let err = Pattern::compile("[").unwrap_err();
        assert!(matches!(err, Error::PatternError(_)));
    }

    #[test]
    fn explicit_anchors_in_source_still_work() {
        let p = Pattern::compile("^chat\\.en$").unwrap();
        assert!(p.matches("chat.en"));
    }
}
