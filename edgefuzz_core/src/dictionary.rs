use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DictionaryError {
    #[error("Illegal dictionary line {line_no}: {line}")]
    IllegalLine { line_no: usize, line: String },
    #[error("Failed to read dictionary file {path:?}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Parses an AFL/libFuzzer style dictionary.
///
/// Each non-empty, non-comment line holds one quoted token, optionally prefixed
/// by a name: `kw_get="GET"`. Inside the quotes `\\`, `\"` and `\xNN` escapes are
/// decoded. Empty tokens are dropped.
pub fn parse_dictionary(text: &str) -> Result<Vec<Vec<u8>>, DictionaryError> {
    let mut tokens = Vec::new();
    for (idx, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let illegal = || DictionaryError::IllegalLine {
            line_no: idx + 1,
            line: line.to_string(),
        };

        let open = line.find('"').ok_or_else(illegal)?;
        if line.len() < open + 2 || !line.ends_with('"') {
            return Err(illegal());
        }
        let body = &line[open + 1..line.len() - 1];
        let token = decode_escapes(body).ok_or_else(illegal)?;
        if !token.is_empty() {
            tokens.push(token);
        }
    }
    Ok(tokens)
}

/// Reads and parses a dictionary file.
pub fn load_dictionary_file(path: &Path) -> Result<Vec<Vec<u8>>, DictionaryError> {
    let text = fs::read_to_string(path).map_err(|source| DictionaryError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_dictionary(&text)
}

fn decode_escapes(body: &str) -> Option<Vec<u8>> {
    let bytes = body.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                match *bytes.get(i + 1)? {
                    b'\\' => out.push(b'\\'),
                    b'"' => out.push(b'"'),
                    b'x' => {
                        let hex = body.get(i + 2..i + 4)?;
                        out.push(u8::from_str_radix(hex, 16).ok()?);
                        i += 2;
                    }
                    _ => return None,
                }
                i += 2;
            }
            // unescaped quote inside the token
            b'"' => return None,
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    Some(out)
}
