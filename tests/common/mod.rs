use std::fmt::Write as _;

/// Writes streams the way the archiver does: one header line per record, content in blocks.
#[derive(Default)]
pub struct Stream {
    data: Vec<u8>,
}

impl Stream {
    pub fn new() -> Self {
        Self::default()
    }

    fn header(
        &mut self,
        op: char,
        ty: char,
        mode: u32,
        dev: (u32, u32),
        path: &str,
        target: &str,
    ) -> &mut Self {
        let mut line = String::new();
        writeln!(
            line,
            "{op}{ty} {mode:o} 1000 1000 1700000000 {},{} {} {}",
            dev.0,
            dev.1,
            path.len(),
            target.len()
        )
        .unwrap();
        self.data.extend_from_slice(line.as_bytes());
        self.data.extend_from_slice(path.as_bytes());
        self.data.extend_from_slice(target.as_bytes());
        self
    }

    pub fn dir(&mut self, path: &str, mode: u32) -> &mut Self {
        self.header('+', 'd', mode, (0, 0), path, "")
    }

    pub fn file(&mut self, path: &str, mode: u32, content: &[u8]) -> &mut Self {
        self.header('+', '-', mode, (0, 0), path, "");
        for chunk in content.chunks(8192) {
            self.data
                .extend_from_slice(format!("01BLOCK{:05}\n", chunk.len()).as_bytes());
            self.data.extend_from_slice(chunk);
        }
        self.data.extend_from_slice(b"01BLOCK00000\n");
        self
    }

    pub fn symlink(&mut self, path: &str, target: &str) -> &mut Self {
        self.header('+', 'l', 0o777, (0, 0), path, target)
    }

    pub fn hardlink(&mut self, path: &str, target: &str) -> &mut Self {
        self.header('+', 'h', 0o644, (0, 0), path, target)
    }

    pub fn fifo(&mut self, path: &str, mode: u32) -> &mut Self {
        self.header('+', 'p', mode, (0, 0), path, "")
    }

    pub fn remove(&mut self, path: &str) -> &mut Self {
        self.header('-', '-', 0, (0, 0), path, "")
    }

    pub fn raw(&mut self, data: &[u8]) -> &mut Self {
        self.data.extend_from_slice(data);
        self
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}
