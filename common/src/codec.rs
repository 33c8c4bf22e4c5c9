//! Line format of a pair store.
//!
//! One pair per line: `base64(key) SP base64(value) LF`, URL-safe alphabet
//! with padding. Encoding both halves lets keys and values carry spaces and
//! newlines.

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::URL_SAFE, Engine as _};

use crate::Pair;

pub fn encode_line(pair: &Pair) -> String {
    format!(
        "{} {}\n",
        URL_SAFE.encode(pair.key.as_bytes()),
        URL_SAFE.encode(pair.value.as_bytes())
    )
}

/// Decodes one line (without its trailing newline).
pub fn decode_line(line: &str) -> Result<Pair> {
    let (key, value) = line
        .split_once(' ')
        .ok_or_else(|| anyhow!("malformed record {line:?}: missing separator"))?;

    let key = decode_field(key).context("failed to decode key")?;
    let value = decode_field(value).context("failed to decode value")?;
    Ok(Pair { key, value })
}

fn decode_field(field: &str) -> Result<String> {
    let bytes = URL_SAFE.decode(field)?;
    Ok(String::from_utf8(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separators_inside_fields_are_preserved() {
        let pair = Pair::new("two words", "line one\nline two");
        let line = encode_line(&pair);
        assert_eq!(line.matches('\n').count(), 1);
        assert_eq!(line.matches(' ').count(), 1);
        assert_eq!(decode_line(line.trim_end_matches('\n')).unwrap(), pair);
    }

    #[test]
    fn empty_key_and_value_still_form_a_line() {
        let line = encode_line(&Pair::default());
        assert_eq!(line, " \n");
        assert_eq!(decode_line(" ").unwrap(), Pair::default());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(decode_line("no-separator").is_err());
        assert!(decode_line("!!! ???").is_err());
    }
}
