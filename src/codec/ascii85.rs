//! Streaming ascii85 in the undelimited form: no `<~ ~>` framing, `z` for an
//! all-zero group, and short final groups written as `n + 1` characters.

use std::io::{self, Read, Write};

const BASE: u64 = 85;
const FIRST: u8 = b'!';
const LAST: u8 = b'u';
const READ_BUF: usize = 8 * 1024;

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

fn encode_group(group: [u8; 4], n: usize, out: &mut Vec<u8>) {
    let mut value = u32::from_be_bytes(group);
    if n == 4 && value == 0 {
        out.push(b'z');
        return;
    }
    let mut digits = [0u8; 5];
    for digit in digits.iter_mut().rev() {
        *digit = (value % 85) as u8 + FIRST;
        value /= 85;
    }
    out.extend_from_slice(&digits[..n + 1]);
}

/// Encodes everything written to it and forwards the text to `inner`.
pub struct Ascii85Encoder<W: Write> {
    inner: W,
    group: [u8; 4],
    len: usize,
    scratch: Vec<u8>,
}

impl<W: Write> Ascii85Encoder<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            group: [0; 4],
            len: 0,
            scratch: Vec::with_capacity(READ_BUF),
        }
    }

    /// Flushes the trailing partial group and returns the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.scratch.clear();
        if self.len > 0 {
            let mut group = [0u8; 4];
            group[..self.len].copy_from_slice(&self.group[..self.len]);
            encode_group(group, self.len, &mut self.scratch);
            self.len = 0;
        }
        self.inner.write_all(&self.scratch)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for Ascii85Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.scratch.clear();
        for &byte in buf {
            self.group[self.len] = byte;
            self.len += 1;
            if self.len == 4 {
                encode_group(self.group, 4, &mut self.scratch);
                self.len = 0;
            }
        }
        self.inner.write_all(&self.scratch)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Decodes ascii85 text read from `inner`. Whitespace is ignored.
pub struct Ascii85Decoder<R: Read> {
    inner: R,
    input: Box<[u8]>,
    in_pos: usize,
    in_len: usize,
    value: u64,
    count: usize,
    out: [u8; 4],
    out_pos: usize,
    out_len: usize,
    finished: bool,
}

impl<R: Read> Ascii85Decoder<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            input: vec![0; READ_BUF].into_boxed_slice(),
            in_pos: 0,
            in_len: 0,
            value: 0,
            count: 0,
            out: [0; 4],
            out_pos: 0,
            out_len: 0,
            finished: false,
        }
    }

    fn next_byte(&mut self) -> io::Result<Option<u8>> {
        if self.in_pos == self.in_len {
            self.in_len = self.inner.read(&mut self.input)?;
            self.in_pos = 0;
            if self.in_len == 0 {
                return Ok(None);
            }
        }
        let byte = self.input[self.in_pos];
        self.in_pos += 1;
        Ok(Some(byte))
    }

    fn emit(&mut self, bytes: [u8; 4], len: usize) {
        self.out = bytes;
        self.out_pos = 0;
        self.out_len = len;
    }

    fn push(&mut self, byte: u8) -> io::Result<()> {
        match byte {
            FIRST..=LAST => {
                self.value = self.value * BASE + u64::from(byte - FIRST);
                self.count += 1;
                if self.count == 5 {
                    let value = u32::try_from(self.value)
                        .map_err(|_| invalid("ascii85 group overflows 32 bits"))?;
                    self.emit(value.to_be_bytes(), 4);
                    self.value = 0;
                    self.count = 0;
                }
                Ok(())
            }
            b'z' if self.count == 0 => {
                self.emit([0; 4], 4);
                Ok(())
            }
            b'z' => Err(invalid("'z' inside an ascii85 group")),
            b if b.is_ascii_whitespace() || b == 0x0b => Ok(()),
            other => Err(invalid(format!("illegal ascii85 byte {other:#04x}"))),
        }
    }

    fn finish_group(&mut self) -> io::Result<()> {
        self.finished = true;
        match self.count {
            0 => Ok(()),
            1 => Err(invalid("truncated ascii85 group")),
            count => {
                for _ in count..5 {
                    self.value = self.value * BASE + u64::from(LAST - FIRST);
                }
                let value = u32::try_from(self.value)
                    .map_err(|_| invalid("ascii85 group overflows 32 bits"))?;
                self.emit(value.to_be_bytes(), count - 1);
                self.count = 0;
                Ok(())
            }
        }
    }
}

impl<R: Read> Read for Ascii85Decoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            if self.out_pos < self.out_len {
                let n = (self.out_len - self.out_pos).min(buf.len() - written);
                buf[written..written + n]
                    .copy_from_slice(&self.out[self.out_pos..self.out_pos + n]);
                self.out_pos += n;
                written += n;
                continue;
            }
            if self.finished {
                break;
            }
            // Hand back what we have rather than block on another read.
            if written > 0 && self.in_pos == self.in_len {
                break;
            }
            match self.next_byte()? {
                Some(byte) => self.push(byte)?,
                None => self.finish_group()?,
            }
        }
        Ok(written)
    }
}
