//! Three-way merge of a working file against an incoming text change.
//!
//! The ancestor is the pristine the working file was checked out from, the
//! local side is the working file and the incoming side is the new pristine.
//! `diffy` does the line matching; anything it cannot reconcile is written
//! between markers in the configured [`ConflictStyle`].

use std::ops::RangeInclusive;

use tracing::{debug, trace};

use crate::config::{ConflictStyle, MergeConfig};
use crate::errors::ConflictError;

/// Merged text, with the 1-based line ranges of any marker blocks in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextMerge {
    pub text: String,
    pub conflicts: Vec<RangeInclusive<usize>>,
}

impl TextMerge {
    fn clean(text: &str) -> Self {
        Self {
            text: text.to_string(),
            conflicts: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }
}

#[derive(Debug)]
pub struct Merger {
    options: diffy::MergeOptions,
    marker_length: usize,
}

impl Merger {
    pub fn new(config: &MergeConfig) -> Self {
        let mut options = diffy::MergeOptions::new();
        options
            .set_conflict_style(match config.conflict_style {
                ConflictStyle::Merge => diffy::ConflictStyle::Merge,
                ConflictStyle::Diff3 => diffy::ConflictStyle::Diff3,
            })
            .set_conflict_marker_length(config.marker_length);
        Self {
            options,
            marker_length: config.marker_length,
        }
    }

    /// Merge file contents. `None` means one of the three is not UTF-8 and
    /// the file has to be treated as binary.
    pub fn merge_bytes(
        &self,
        ancestor: &[u8],
        local: &[u8],
        incoming: &[u8],
    ) -> Result<Option<TextMerge>, ConflictError> {
        let (Ok(ancestor), Ok(local), Ok(incoming)) = (
            std::str::from_utf8(ancestor),
            std::str::from_utf8(local),
            std::str::from_utf8(incoming),
        ) else {
            debug!("binary content, not merging");
            return Ok(None);
        };
        self.merge_text(ancestor, local, incoming).map(Some)
    }

    pub fn merge_text(&self, ancestor: &str, local: &str, incoming: &str) -> Result<TextMerge, ConflictError> {
        if local == ancestor || local == incoming {
            trace!("no local text change");
            return Ok(TextMerge::clean(incoming));
        }
        if incoming == ancestor {
            trace!("no incoming text change");
            return Ok(TextMerge::clean(local));
        }

        // An incoming hunk that still applies to the local text needs no
        // region-level merge at all.
        if let Ok(text) = diffy::apply(local, &diffy::create_patch(ancestor, incoming)) {
            trace!("incoming change applied as a patch");
            return Ok(TextMerge::clean(&text));
        }

        match self.options.merge(ancestor, local, incoming) {
            Ok(text) => Ok(TextMerge::clean(&text)),
            Err(text) => {
                let conflicts = marker_blocks(&text, self.marker_length);
                if conflicts.is_empty() {
                    return Err(ConflictError::MergeFailed(
                        "merge reported conflicts without markers".into(),
                    ));
                }
                debug!(regions = conflicts.len(), "text merge conflicted");
                Ok(TextMerge { text, conflicts })
            }
        }
    }
}

fn marker_blocks(text: &str, marker_length: usize) -> Vec<RangeInclusive<usize>> {
    let open = "<".repeat(marker_length);
    let close = ">".repeat(marker_length);
    let mut blocks = Vec::new();
    let mut opened_at = None;

    for (line_no, line) in (1..).zip(text.lines()) {
        if line.starts_with(&open) {
            opened_at = Some(line_no);
        } else if line.starts_with(&close) {
            if let Some(start) = opened_at.take() {
                blocks.push(start..=line_no);
            }
        }
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    const ANCESTOR: &str = "alpha\nbeta\ngamma\ndelta\nepsilon\n";

    fn merge(local: &str, incoming: &str) -> TextMerge {
        Merger::new(&MergeConfig::default())
            .merge_text(ANCESTOR, local, incoming)
            .unwrap()
    }

    #[test]
    fn test_one_sided_changes_win() {
        let edited = "alpha\nbeta\nGAMMA\ndelta\nepsilon\n";
        assert_eq!(merge(ANCESTOR, edited), TextMerge::clean(edited));
        assert_eq!(merge(edited, ANCESTOR), TextMerge::clean(edited));
        assert_eq!(merge(edited, edited), TextMerge::clean(edited));
    }

    #[test]
    fn test_separate_hunks_combine() {
        let result = merge(
            "ALPHA\nbeta\ngamma\ndelta\nepsilon\n",
            "alpha\nbeta\ngamma\ndelta\nEPSILON\n",
        );
        assert!(result.is_clean());
        assert_eq!(result.text, "ALPHA\nbeta\ngamma\ndelta\nEPSILON\n");
    }

    #[test]
    fn test_same_line_edits_conflict() {
        let result = merge(
            "alpha\nbeta\nlocal\ndelta\nepsilon\n",
            "alpha\nbeta\nincoming\ndelta\nepsilon\n",
        );
        assert!(!result.is_clean());
        assert_eq!(result.conflicts.len(), 1);
        for needle in ["<<<<<<<", "=======", ">>>>>>>", "local", "incoming"] {
            assert!(result.text.contains(needle), "missing {needle}");
        }
    }

    #[test]
    fn test_diff3_shows_ancestor_and_marker_length() {
        let config = MergeConfig {
            conflict_style: ConflictStyle::Diff3,
            marker_length: 9,
        };
        let result = Merger::new(&config)
            .merge_text("a\nbase\nc\n", "a\nmine\nc\n", "a\ntheirs\nc\n")
            .unwrap();
        assert!(!result.is_clean());
        assert!(result.text.contains("|||||||||"));
        assert!(result.text.contains("<<<<<<<<<"));
        assert!(result.text.contains("base"));
    }

    #[test]
    fn test_non_utf8_is_binary() {
        let merger = Merger::new(&MergeConfig::default());
        assert!(merger.merge_bytes(b"x\n", &[0xff, 0xfe, 0x00], b"y\n").unwrap().is_none());
        assert!(merger.merge_bytes(b"x\n", b"x\n", b"y\n").unwrap().is_some());
    }

    #[test]
    fn test_marker_blocks() {
        let text = "a\n<<<<<<< mine\nx\n=======\ny\n>>>>>>> theirs\nb\n>>>>>>> stray\n";
        assert_eq!(marker_blocks(text, 7), vec![2..=6]);
    }
}
