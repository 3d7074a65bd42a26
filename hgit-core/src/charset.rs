//! Best-effort decoding of byte strings of unknown charset.

/// Charset a byte string was decoded with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charset {
    Utf8,
    Latin1,
    /// ASCII with U+FFFD for every byte above 0x7f
    Ascii,
}

impl Charset {
    pub fn name(&self) -> &'static str {
        match self {
            Charset::Utf8 => "UTF-8",
            Charset::Latin1 => "ISO-8859-1",
            Charset::Ascii => "US-ASCII",
        }
    }

    /// Recognize a declared encoding label
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Some(Charset::Utf8),
            "iso-8859-1" | "iso8859-1" | "latin-1" | "latin1" | "l1" => Some(Charset::Latin1),
            "ascii" | "us-ascii" => Some(Charset::Ascii),
            _ => None,
        }
    }
}

/// Decode `bytes`, trying the declared charset, then UTF-8, then Latin-1,
/// then ASCII with replacement. The last step always succeeds.
pub fn decode(bytes: &[u8], declared: Option<&str>) -> (String, Charset) {
    if let Some(charset) = declared.and_then(Charset::from_label) {
        if let Some(text) = decode_with(bytes, charset) {
            return (text, charset);
        }
    }
    if let Ok(text) = std::str::from_utf8(bytes) {
        return (text.to_string(), Charset::Utf8);
    }
    if let Some(text) = decode_with(bytes, Charset::Latin1) {
        return (text, Charset::Latin1);
    }
    (ascii_lossy(bytes), Charset::Ascii)
}

fn decode_with(bytes: &[u8], charset: Charset) -> Option<String> {
    match charset {
        Charset::Utf8 => std::str::from_utf8(bytes).ok().map(str::to_string),
        // C1 control bytes almost never appear in real Latin-1 text.
        Charset::Latin1 if bytes.iter().any(|b| (0x80..0xa0).contains(b)) => None,
        Charset::Latin1 => Some(bytes.iter().map(|&b| b as char).collect()),
        Charset::Ascii => Some(ascii_lossy(bytes)),
    }
}

fn ascii_lossy(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if b.is_ascii() { b as char } else { char::REPLACEMENT_CHARACTER })
        .collect()
}
