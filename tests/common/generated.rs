use std::io::Read;

pub const PAYLOAD_BYTES: usize = 4 * 1024;

/// Produces a session document piece by piece so the full text never exists
/// in memory.
pub struct GeneratedSession {
    chapters: usize,
    next_chapter: usize,
    piece: Vec<u8>,
    pos: usize,
    footer_written: bool,
}

impl GeneratedSession {
    pub fn new(chapters: usize) -> Self {
        let header = format!(
            r#"{{"metadata":{{"format":"lexiconforge-full-1","chapterCount":{chapters}}},"chapters":["#
        );
        Self {
            chapters,
            next_chapter: 1,
            piece: header.into_bytes(),
            pos: 0,
            footer_written: false,
        }
    }

    fn refill(&mut self) -> bool {
        self.pos = 0;
        self.piece.clear();
        if self.next_chapter <= self.chapters {
            let n = self.next_chapter;
            self.next_chapter += 1;
            if n > 1 {
                self.piece.push(b',');
            }
            let content = "x".repeat(PAYLOAD_BYTES);
            let chapter = format!(
                r#"{{"url":"https://novel.example/ch/{n}","chapterNumber":{n},"content":"{content}","translations":[{{"translation":"{content}"}}]}}"#
            );
            self.piece.extend_from_slice(chapter.as_bytes());
            return true;
        }
        if !self.footer_written {
            self.footer_written = true;
            self.piece.extend_from_slice(br#"],"version":{"schema":2}}"#);
            return true;
        }
        false
    }
}

impl Read for GeneratedSession {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pos == self.piece.len() && !self.refill() {
            return Ok(0);
        }
        let n = buf.len().min(self.piece.len() - self.pos);
        buf[..n].copy_from_slice(&self.piece[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// The same document as a chunk stream of `chunk_size` byte reads.
pub fn chunk_stream(
    chapters: usize,
    chunk_size: usize,
) -> impl futures::Stream<Item = Result<Vec<u8>, lexiconforge_import::ImportError>> {
    futures::stream::unfold(GeneratedSession::new(chapters), move |mut source| async move {
        let mut buf = vec![0; chunk_size];
        match source.read(&mut buf) {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(buf), source))
            }
            Err(err) => Some((
                Err(lexiconforge_import::ImportError::Io {
                    what: "generated session".to_owned(),
                    source: err,
                }),
                source,
            )),
        }
    })
}
