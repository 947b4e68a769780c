//! Extraction of the armored objects (keys, signatures) that follow
//! some keyword lines.
//!
//! An object is a base64 payload between an exact `-----BEGIN ...-----`
//! line and the matching `-----END ...-----` line. The payload is only
//! split across lines for length reasons, so its lines are joined without
//! separators.

use super::Lines;
use crate::error::DocumentParseError;

/// The kinds of objects that appear in the documents we parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    RsaPublicKey,
    Signature,
    IdSignature,
}

impl BlockKind {
    pub fn begin_marker(self) -> &'static str {
        match self {
            BlockKind::RsaPublicKey => "-----BEGIN RSA PUBLIC KEY-----",
            BlockKind::Signature => "-----BEGIN SIGNATURE-----",
            BlockKind::IdSignature => "-----BEGIN ID SIGNATURE-----",
        }
    }

    pub fn end_marker(self) -> &'static str {
        match self {
            BlockKind::RsaPublicKey => "-----END RSA PUBLIC KEY-----",
            BlockKind::Signature => "-----END SIGNATURE-----",
            BlockKind::IdSignature => "-----END ID SIGNATURE-----",
        }
    }
}

/// An extracted object: its kind and the concatenated base64 payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub kind: BlockKind,
    pub data: String,
}

impl Block {
    /// Decode the payload. Extraction already checked that this succeeds.
    pub fn decode(&self) -> Result<Vec<u8>, DocumentParseError> {
        base64::decode(&self.data).map_err(|_| DocumentParseError::SignatureBlockError {
            marker: self.kind.begin_marker().to_string(),
        })
    }
}

/// Extract an object of the given kind. The cursor must sit right before
/// the begin marker; on success it sits right after the end marker.
pub(crate) fn extract(lines: &mut Lines<'_>, kind: BlockKind) -> Result<Block, DocumentParseError> {
    let begin = kind.begin_marker();
    match lines.next_line() {
        Some((_, line)) if line == begin => {}
        Some((line_no, _)) => {
            return Err(DocumentParseError::MissingBeginMarker {
                expected: begin.to_string(),
                line: line_no,
            })
        }
        None => {
            return Err(DocumentParseError::UnexpectedEndOfDocument {
                context: format!("'{}'", begin),
            })
        }
    }

    let mut data = String::new();
    loop {
        match lines.next_line() {
            Some((_, line)) if line == kind.end_marker() => break,
            Some((_, line)) => data.push_str(line),
            None => {
                return Err(DocumentParseError::UnterminatedBlock {
                    marker: begin.to_string(),
                })
            }
        }
    }

    let block = Block { kind, data };
    block.decode()?;
    Ok(block)
}

/// Skip an object of any kind if one starts at the cursor. Used when
/// tolerating unknown keywords, which may carry objects we do not know.
pub(crate) fn skip_any(lines: &mut Lines<'_>) -> Result<bool, DocumentParseError> {
    let tag = match lines.peek_line() {
        Some(line) if line.starts_with("-----BEGIN ") && line.ends_with("-----") => {
            line["-----BEGIN ".len()..line.len() - "-----".len()].to_string()
        }
        _ => return Ok(false),
    };
    let end = format!("-----END {}-----", tag);
    lines.next_line();
    loop {
        match lines.next_line() {
            Some((_, line)) if line == end => return Ok(true),
            Some(_) => {}
            None => {
                return Err(DocumentParseError::UnterminatedBlock {
                    marker: format!("-----BEGIN {}-----", tag),
                })
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn joins_payload_lines() {
        let text = "-----BEGIN SIGNATURE-----\nSGVsbG8g\nd29ybGQh\n-----END SIGNATURE-----\nnext 1\n";
        let mut lines = Lines::new(text);
        let block = extract(&mut lines, BlockKind::Signature).unwrap();
        assert_eq!(block.data, "SGVsbG8gd29ybGQh");
        assert_eq!(block.decode().unwrap(), b"Hello world!");
        assert_eq!(lines.next_item().unwrap().unwrap().keyword, "next");
    }

    #[test]
    fn wrong_marker() {
        let text = "-----BEGIN SIGNATURE-----\nAAAA\n-----END SIGNATURE-----\n";
        let mut lines = Lines::new(text);
        let err = extract(&mut lines, BlockKind::RsaPublicKey).unwrap_err();
        assert!(matches!(err, DocumentParseError::MissingBeginMarker { line: 1, .. }));
    }

    #[test]
    fn unterminated() {
        let text = "-----BEGIN RSA PUBLIC KEY-----\nAAAA\n";
        let mut lines = Lines::new(text);
        let err = extract(&mut lines, BlockKind::RsaPublicKey).unwrap_err();
        assert!(matches!(err, DocumentParseError::UnterminatedBlock { .. }));
    }

    #[test]
    fn bad_payload() {
        let text = "-----BEGIN ID SIGNATURE-----\nnot*base64\n-----END ID SIGNATURE-----\n";
        let mut lines = Lines::new(text);
        let err = extract(&mut lines, BlockKind::IdSignature).unwrap_err();
        assert!(matches!(err, DocumentParseError::SignatureBlockError { .. }));
    }

    #[test]
    fn skip_unknown_object() {
        let text = "-----BEGIN ED25519 CERT-----\nAQQABp\n-----END ED25519 CERT-----\nfoo\n";
        let mut lines = Lines::new(text);
        assert!(skip_any(&mut lines).unwrap());
        assert!(!skip_any(&mut lines).unwrap());
        assert_eq!(lines.next_item().unwrap().unwrap().keyword, "foo");
    }
}
