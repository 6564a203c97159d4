//! Patch bodies carried by `apply_patch` tool calls.
//!
//! A body is framed by `*** Begin Patch` / `*** End Patch` and holds one
//! hunk per touched file: `*** Add File: p` followed by `+` lines,
//! `*** Delete File: p` on its own, or `*** Update File: p` followed by an
//! optional `*** Move to: p` and one or more change chunks. A chunk opens
//! with an optional `@@ context` marker and carries `+`/`-`/space diff
//! lines; `*** End of File` pins the final chunk to the end of the file.
//!
//! Transcripts never hand us a bare body: it arrives embedded in the JSON
//! argument string of the tool call, so extraction from that wrapper is part
//! of this module's surface. The parser itself is a single pass over the
//! body's lines with the hunk under construction as explicit state, the same
//! shape the mirror uses to replay segment files.

use thiserror::Error;

const BEGIN_PATCH_MARKER: &str = "*** Begin Patch";
const END_PATCH_MARKER: &str = "*** End Patch";
const ADD_FILE_MARKER: &str = "*** Add File: ";
const DELETE_FILE_MARKER: &str = "*** Delete File: ";
const UPDATE_FILE_MARKER: &str = "*** Update File: ";
const MOVE_TO_MARKER: &str = "*** Move to: ";
const EOF_MARKER: &str = "*** End of File";
const CHANGE_CONTEXT_MARKER: &str = "@@ ";
const EMPTY_CHANGE_CONTEXT_MARKER: &str = "@@";

#[derive(Debug, PartialEq, Error)]
pub enum PatchParseError {
    #[error("invalid patch: {0}")]
    InvalidPatch(String),
    #[error("invalid hunk (line {line_number}): {message}")]
    InvalidHunk { message: String, line_number: usize },
}

use PatchParseError::*;

#[derive(Debug, PartialEq)]
pub enum PatchHunk {
    AddFile {
        path: String,
        /// File contents, one entry per `+` line, prefix stripped.
        lines: Vec<String>,
    },
    DeleteFile {
        path: String,
    },
    UpdateFile {
        path: String,
        move_path: Option<String>,
        chunks: Vec<UpdateChunk>,
    },
}

impl PatchHunk {
    pub fn path(&self) -> &str {
        match self {
            PatchHunk::AddFile { path, .. }
            | PatchHunk::DeleteFile { path }
            | PatchHunk::UpdateFile { path, .. } => path,
        }
    }
}

/// One change block of an update hunk. `lines` keep their leading
/// `+`/`-`/space markers exactly as they appeared.
#[derive(Debug, PartialEq)]
pub struct UpdateChunk {
    pub change_context: Option<String>,
    pub lines: Vec<String>,
    pub is_end_of_file: bool,
}

impl UpdateChunk {
    fn open(change_context: Option<String>) -> Self {
        Self {
            change_context,
            lines: Vec::new(),
            is_end_of_file: false,
        }
    }
}

/// Extract and parse the patch carried by a tool call's argument string, if
/// it embeds one.
pub fn parse_tool_call_patch(arguments: &str) -> Option<Result<Vec<PatchHunk>, PatchParseError>> {
    extract_patch_body(arguments).map(|body| parse_patch(&body))
}

/// Locate a patch body inside a tool-call `arguments` string.
///
/// Arguments usually arrive as a JSON document with the patch embedded in
/// some string field; plain patch bodies are accepted too. Returns the
/// substring from `*** Begin Patch` through `*** End Patch` inclusive.
pub fn extract_patch_body(arguments: &str) -> Option<String> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(arguments) {
        if let Some(body) = find_patch_in_value(&value) {
            return Some(body);
        }
    }
    slice_patch(arguments).map(str::to_string)
}

fn find_patch_in_value(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => slice_patch(s).map(str::to_string),
        serde_json::Value::Array(items) => items.iter().find_map(find_patch_in_value),
        serde_json::Value::Object(map) => map.values().find_map(find_patch_in_value),
        _ => None,
    }
}

fn slice_patch(text: &str) -> Option<&str> {
    let start = text.find(BEGIN_PATCH_MARKER)?;
    let end = text[start..].find(END_PATCH_MARKER)?;
    Some(&text[start..start + end + END_PATCH_MARKER.len()])
}

pub fn parse_patch(patch: &str) -> Result<Vec<PatchHunk>, PatchParseError> {
    let lines: Vec<&str> = patch.trim().lines().collect();
    if lines.first().map(|l| l.trim()) != Some(BEGIN_PATCH_MARKER) {
        return Err(InvalidPatch(format!(
            "the first line of the patch must be '{BEGIN_PATCH_MARKER}'"
        )));
    }
    if lines.len() < 2 || lines.last().map(|l| l.trim()) != Some(END_PATCH_MARKER) {
        return Err(InvalidPatch(format!(
            "the last line of the patch must be '{END_PATCH_MARKER}'"
        )));
    }

    let mut walker = Walker::default();
    for (offset, raw) in lines[1..lines.len() - 1].iter().enumerate() {
        // 1-based, counting the Begin marker as line 1.
        walker.step(raw, offset + 2)?;
    }
    walker.finish(lines.len())
}

/// Single-pass patch walker: the hunk currently being built is the state,
/// and every line either extends it or closes it and opens the next one.
#[derive(Default)]
struct Walker {
    hunks: Vec<PatchHunk>,
    building: Building,
}

#[derive(Default)]
enum Building {
    #[default]
    Idle,
    Add {
        path: String,
        added: Vec<String>,
    },
    Update(UpdateInProgress),
}

struct UpdateInProgress {
    path: String,
    move_path: Option<String>,
    /// Line the `*** Update File:` header sits on, for error reporting.
    header_line: usize,
    chunks: Vec<UpdateChunk>,
    current: Option<UpdateChunk>,
    /// `*** Move to:` is only legal directly under the header.
    move_allowed: bool,
}

impl Walker {
    fn step(&mut self, raw: &str, line_number: usize) -> Result<(), PatchParseError> {
        // A leading space means a context line inside a chunk, even when the
        // text itself resembles a marker.
        let in_chunk = matches!(&self.building, Building::Update(u) if u.current.is_some());
        let trimmed = raw.trim();
        if trimmed.starts_with("***") && !(in_chunk && raw.starts_with(' ')) {
            return self.marker(trimmed, line_number);
        }

        match &mut self.building {
            Building::Idle => Err(InvalidHunk {
                message: format!(
                    "'{trimmed}' is outside of any hunk. Valid hunk headers: \
                     '{ADD_FILE_MARKER}{{path}}', '{DELETE_FILE_MARKER}{{path}}', \
                     '{UPDATE_FILE_MARKER}{{path}}'"
                ),
                line_number,
            }),
            Building::Add { added, .. } => match raw.strip_prefix('+') {
                Some(text) => {
                    added.push(text.to_string());
                    Ok(())
                }
                None => Err(InvalidHunk {
                    message: format!("add hunks only contain '+' lines, got '{raw}'"),
                    line_number,
                }),
            },
            Building::Update(update) => update.take_line(raw, line_number),
        }
    }

    fn marker(&mut self, header: &str, line_number: usize) -> Result<(), PatchParseError> {
        // Two markers extend the update hunk in progress instead of opening
        // a new one.
        if let Some(target) = header.strip_prefix(MOVE_TO_MARKER) {
            let Building::Update(update) = &mut self.building else {
                return Err(InvalidHunk {
                    message: "'*** Move to:' outside an update hunk".to_string(),
                    line_number,
                });
            };
            if !update.move_allowed {
                return Err(InvalidHunk {
                    message: "'*** Move to:' must directly follow its update header".to_string(),
                    line_number,
                });
            }
            update.move_path = Some(target.to_string());
            update.move_allowed = false;
            return Ok(());
        }
        if header == EOF_MARKER {
            let Building::Update(update) = &mut self.building else {
                return Err(InvalidHunk {
                    message: "'*** End of File' outside an update hunk".to_string(),
                    line_number,
                });
            };
            return update.pin_end_of_file(line_number);
        }

        // Everything else starts a new hunk; seal the previous one first.
        self.seal(line_number)?;
        if let Some(path) = header.strip_prefix(ADD_FILE_MARKER) {
            self.building = Building::Add {
                path: path.to_string(),
                added: Vec::new(),
            };
        } else if let Some(path) = header.strip_prefix(DELETE_FILE_MARKER) {
            self.hunks.push(PatchHunk::DeleteFile {
                path: path.to_string(),
            });
        } else if let Some(path) = header.strip_prefix(UPDATE_FILE_MARKER) {
            self.building = Building::Update(UpdateInProgress {
                path: path.to_string(),
                move_path: None,
                header_line: line_number,
                chunks: Vec::new(),
                current: None,
                move_allowed: true,
            });
        } else {
            return Err(InvalidHunk {
                message: format!("unrecognised marker '{header}'"),
                line_number,
            });
        }
        Ok(())
    }

    fn seal(&mut self, line_number: usize) -> Result<(), PatchParseError> {
        match std::mem::take(&mut self.building) {
            Building::Idle => {}
            Building::Add { path, added } => {
                self.hunks.push(PatchHunk::AddFile { path, lines: added });
            }
            Building::Update(update) => {
                self.hunks.push(update.into_hunk(line_number)?);
            }
        }
        Ok(())
    }

    fn finish(mut self, end_line: usize) -> Result<Vec<PatchHunk>, PatchParseError> {
        self.seal(end_line)?;
        Ok(self.hunks)
    }
}

impl UpdateInProgress {
    fn take_line(&mut self, raw: &str, line_number: usize) -> Result<(), PatchParseError> {
        self.move_allowed = false;

        if let Some(context) = context_of(raw) {
            self.seal_chunk(line_number)?;
            self.current = Some(UpdateChunk::open(context));
            return Ok(());
        }
        if raw.trim().is_empty() {
            // Inside a chunk an empty line stands for an unchanged empty
            // line; between chunks it is just a separator.
            if let Some(chunk) = &mut self.current {
                chunk.lines.push(" ".to_string());
            }
            return Ok(());
        }
        if !matches!(raw.chars().next(), Some(' ' | '+' | '-')) {
            return Err(InvalidHunk {
                message: format!(
                    "'{raw}' is not a diff line. Every chunk line starts with ' ' \
                     (context), '+' (added) or '-' (removed)"
                ),
                line_number,
            });
        }
        // Only the first chunk of a hunk may begin without a @@ marker.
        if self.current.is_none() && !self.chunks.is_empty() {
            return Err(InvalidHunk {
                message: format!("expected a @@ context marker before '{raw}'"),
                line_number,
            });
        }
        self.current
            .get_or_insert_with(|| UpdateChunk::open(None))
            .lines
            .push(raw.to_string());
        Ok(())
    }

    fn seal_chunk(&mut self, line_number: usize) -> Result<(), PatchParseError> {
        if let Some(chunk) = self.current.take() {
            if chunk.lines.is_empty() {
                return Err(InvalidHunk {
                    message: "change chunk contains no lines".to_string(),
                    line_number,
                });
            }
            self.chunks.push(chunk);
        }
        Ok(())
    }

    fn pin_end_of_file(&mut self, line_number: usize) -> Result<(), PatchParseError> {
        match self.current.take() {
            Some(mut chunk) if !chunk.lines.is_empty() => {
                chunk.is_end_of_file = true;
                self.chunks.push(chunk);
                Ok(())
            }
            _ => Err(InvalidHunk {
                message: "'*** End of File' without a preceding change chunk".to_string(),
                line_number,
            }),
        }
    }

    fn into_hunk(mut self, line_number: usize) -> Result<PatchHunk, PatchParseError> {
        self.seal_chunk(line_number)?;
        if self.chunks.is_empty() {
            return Err(InvalidHunk {
                message: format!("update file hunk for path '{}' is empty", self.path),
                line_number: self.header_line,
            });
        }
        Ok(PatchHunk::UpdateFile {
            path: self.path,
            move_path: self.move_path,
            chunks: self.chunks,
        })
    }
}

fn context_of(raw: &str) -> Option<Option<String>> {
    let trimmed = raw.trim_end();
    if trimmed == EMPTY_CHANGE_CONTEXT_MARKER {
        return Some(None);
    }
    trimmed
        .strip_prefix(CHANGE_CONTEXT_MARKER)
        .map(|context| Some(context.to_string()))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn rejects_missing_markers() {
        assert_eq!(
            parse_patch("bad"),
            Err(InvalidPatch(
                "the first line of the patch must be '*** Begin Patch'".to_string()
            ))
        );
        assert_eq!(
            parse_patch("*** Begin Patch\nbad"),
            Err(InvalidPatch(
                "the last line of the patch must be '*** End Patch'".to_string()
            ))
        );
        assert_eq!(parse_patch("*** Begin Patch\n*** End Patch"), Ok(Vec::new()));
    }

    #[test]
    fn parses_mixed_hunks() {
        let hunks = parse_patch(
            "*** Begin Patch\n\
             *** Add File: path/add.py\n\
             +abc\n\
             +def\n\
             *** Delete File: path/delete.py\n\
             *** Update File: path/update.py\n\
             *** Move to: path/update2.py\n\
             @@ def f():\n\
             -    pass\n\
             +    return 123\n\
             *** End Patch",
        );
        assert_eq!(
            hunks,
            Ok(vec![
                PatchHunk::AddFile {
                    path: "path/add.py".to_string(),
                    lines: vec!["abc".to_string(), "def".to_string()],
                },
                PatchHunk::DeleteFile {
                    path: "path/delete.py".to_string(),
                },
                PatchHunk::UpdateFile {
                    path: "path/update.py".to_string(),
                    move_path: Some("path/update2.py".to_string()),
                    chunks: vec![UpdateChunk {
                        change_context: Some("def f():".to_string()),
                        lines: vec!["-    pass".to_string(), "+    return 123".to_string()],
                        is_end_of_file: false,
                    }],
                },
            ])
        );
    }

    #[test]
    fn update_chunk_without_context_marker_parses() {
        let hunks = parse_patch(
            "*** Begin Patch\n\
             *** Update File: b.ts\n\
             -y\n\
             +z\n\
             *** End Patch",
        );
        assert_eq!(
            hunks,
            Ok(vec![PatchHunk::UpdateFile {
                path: "b.ts".to_string(),
                move_path: None,
                chunks: vec![UpdateChunk {
                    change_context: None,
                    lines: vec!["-y".to_string(), "+z".to_string()],
                    is_end_of_file: false,
                }],
            }])
        );
    }

    #[test]
    fn later_chunks_require_a_context_marker() {
        let err = parse_patch(
            "*** Begin Patch\n\
             *** Update File: b.ts\n\
             @@ fn a()\n\
             +one\n\
             @@ fn b()\n\
             +two\n\
             *** End Patch",
        );
        assert!(err.is_ok(), "marked chunks parse: {err:?}");

        // Once a chunk has been closed, the next one needs its own marker.
        let err = parse_patch(
            "*** Begin Patch\n\
             *** Update File: b.ts\n\
             @@ fn a()\n\
             +one\n\
             *** End of File\n\
             +two-without-marker\n\
             *** End Patch",
        );
        assert_eq!(
            err,
            Err(InvalidHunk {
                message: "expected a @@ context marker before '+two-without-marker'".to_string(),
                line_number: 6,
            })
        );
    }

    #[test]
    fn end_of_file_pins_the_last_chunk() {
        let hunks = parse_patch(
            "*** Begin Patch\n\
             *** Update File: tail.txt\n\
             @@\n\
             +appended\n\
             *** End of File\n\
             *** End Patch",
        );
        assert_eq!(
            hunks,
            Ok(vec![PatchHunk::UpdateFile {
                path: "tail.txt".to_string(),
                move_path: None,
                chunks: vec![UpdateChunk {
                    change_context: None,
                    lines: vec!["+appended".to_string()],
                    is_end_of_file: true,
                }],
            }])
        );
    }

    #[test]
    fn empty_update_hunk_is_an_error() {
        assert_eq!(
            parse_patch(
                "*** Begin Patch\n\
                 *** Update File: test.py\n\
                 *** End Patch"
            ),
            Err(InvalidHunk {
                message: "update file hunk for path 'test.py' is empty".to_string(),
                line_number: 2,
            })
        );
    }

    #[test]
    fn misplaced_markers_are_errors() {
        assert_eq!(
            parse_patch(
                "*** Begin Patch\n\
                 *** Move to: nowhere.py\n\
                 *** End Patch"
            ),
            Err(InvalidHunk {
                message: "'*** Move to:' outside an update hunk".to_string(),
                line_number: 2,
            })
        );
        assert_eq!(
            parse_patch(
                "*** Begin Patch\n\
                 bad\n\
                 *** End Patch"
            ),
            Err(InvalidHunk {
                message: "'bad' is outside of any hunk. Valid hunk headers: \
                          '*** Add File: {path}', '*** Delete File: {path}', \
                          '*** Update File: {path}'"
                    .to_string(),
                line_number: 2,
            })
        );
    }

    #[test]
    fn extracts_body_from_json_arguments() {
        let arguments =
            r#"{"input":"*** Begin Patch\n*** Add File: a.ts\n+x\n*** End Patch","cwd":"/tmp"}"#;
        let body = extract_patch_body(arguments);
        assert_eq!(
            body.as_deref(),
            Some("*** Begin Patch\n*** Add File: a.ts\n+x\n*** End Patch")
        );
    }

    #[test]
    fn extracts_body_from_plain_text() {
        let arguments = "run this:\n*** Begin Patch\n*** Delete File: x\n*** End Patch\nthanks";
        let body = extract_patch_body(arguments);
        assert_eq!(
            body.as_deref(),
            Some("*** Begin Patch\n*** Delete File: x\n*** End Patch")
        );
        assert_eq!(extract_patch_body("no patch here"), None);
    }

    #[test]
    fn tool_call_arguments_parse_in_one_step() {
        let arguments =
            r#"{"input":"*** Begin Patch\n*** Delete File: gone.rs\n*** End Patch"}"#;
        let hunks = parse_tool_call_patch(arguments);
        assert_eq!(
            hunks,
            Some(Ok(vec![PatchHunk::DeleteFile {
                path: "gone.rs".to_string(),
            }]))
        );
        assert_eq!(parse_tool_call_patch("{\"input\":\"ls\"}"), None);
    }
}
