use std::io::{self, Read};

/// Reverses the `\u003c`, `\u003e` and `\u0026` escapes that HTML-safe JSON
/// encoders emit for `<`, `>` and `&`, so the written file stays readable.
///
/// The reader walks its buffer once. Escapes are resolved against the source
/// position, never the caller's buffer, so a sequence is decoded correctly no
/// matter how the reads are sized.
pub struct HtmlUnescaper<B> {
    buf: B,
    offset: usize,
}

impl<B: AsRef<[u8]>> HtmlUnescaper<B> {
    pub fn new(buf: B) -> Self {
        Self { buf, offset: 0 }
    }
}

/// A backslash preceded by an odd run of backslashes is itself escaped.
fn is_escaped(src: &[u8], offset: usize) -> bool {
    src[..offset].iter().rev().take_while(|&&b| b == b'\\').count() % 2 == 1
}

fn unescape_at(src: &[u8], offset: usize) -> Option<u8> {
    let seq = src.get(offset..offset + 6)?;
    if &seq[..2] != br"\u" || is_escaped(src, offset) {
        return None;
    }
    match seq[2..].to_ascii_lowercase().as_slice() {
        b"003c" => Some(b'<'),
        b"003e" => Some(b'>'),
        b"0026" => Some(b'&'),
        _ => None,
    }
}

impl<B: AsRef<[u8]>> Read for HtmlUnescaper<B> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let src = self.buf.as_ref();
        let mut n = 0;
        while n < out.len() && self.offset < src.len() {
            match unescape_at(src, self.offset) {
                Some(byte) => {
                    out[n] = byte;
                    self.offset += 6;
                }
                None => {
                    out[n] = src[self.offset];
                    self.offset += 1;
                }
            }
            n += 1;
        }
        Ok(n)
    }
}
