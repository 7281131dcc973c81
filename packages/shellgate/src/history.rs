/// Append-only output history for one session.
///
/// Bounded: once the buffer grows past `max_bytes`, only the most recent
/// `keep_bytes` survive (plus whatever arrives next). Truncation always
/// lands on a char boundary and always preserves an exact suffix of the
/// stream as written.
pub struct SessionHistory {
    buf: String,
    max_bytes: usize,
    keep_bytes: usize,
}

impl SessionHistory {
    pub fn new(max_bytes: usize, keep_bytes: usize) -> Self {
        Self {
            buf: String::new(),
            max_bytes,
            keep_bytes,
        }
    }

    pub fn append(&mut self, text: &str) {
        self.buf.push_str(text);
        if self.buf.len() > self.max_bytes {
            let mut cut = self.buf.len().saturating_sub(self.keep_bytes);
            while cut < self.buf.len() && !self.buf.is_char_boundary(cut) {
                cut += 1;
            }
            self.buf.replace_range(..cut, "");
        }
    }

    pub fn snapshot(&self) -> String {
        self.buf.clone()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
