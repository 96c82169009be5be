use std::io::{Chain, Cursor, Read};

use superdb_error::{Result, ResultExt};

/// Records the leading bytes of a stream so format detection can look at them
/// and the stream can then be replayed from the start.
pub struct Track<R> {
    inner: R,
    prefix: Vec<u8>,
    eof: bool,
}

impl<R: Read> Track<R> {
    pub fn new(inner: R) -> Self {
        Track {
            inner,
            prefix: Vec::new(),
            eof: false,
        }
    }

    /// Reads until at least `n` bytes are recorded or the input ends.
    pub fn fill(&mut self, n: usize) -> Result<&[u8]> {
        let mut chunk = [0u8; 16 * 1024];
        while self.prefix.len() < n && !self.eof {
            let want = chunk.len().min(n - self.prefix.len());
            let got = self.inner.read(&mut chunk[..want]).context("failed to read input")?;
            if got == 0 {
                self.eof = true;
            }
            self.prefix.extend_from_slice(&chunk[..got]);
        }
        Ok(&self.prefix)
    }

    /// The stream from its first byte.
    pub fn rewind(self) -> Chain<Cursor<Vec<u8>>, R> {
        Cursor::new(self.prefix).chain(self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replays_prefix() {
        let mut t = Track::new(Cursor::new(b"abcdef".to_vec()));
        assert_eq!(b"abc", t.fill(3).unwrap());
        let mut s = String::new();
        t.rewind().read_to_string(&mut s).unwrap();
        assert_eq!("abcdef", s);
    }

    #[test]
    fn short_input() {
        let mut t = Track::new(Cursor::new(b"ab".to_vec()));
        assert_eq!(b"ab", t.fill(10).unwrap());
    }
}
