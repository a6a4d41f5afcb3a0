//! Grain payload encodings.
//!
//! Payloads travel as JSON strings and live in text columns, so binary content
//! is always carried in a textual scheme. The `z*` schemes gzip first.

mod ascii85;

use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};

pub use ascii85::{Ascii85Decoder, Ascii85Encoder};

use crate::error::{Error, Result};

/// Standard alphabet, written unpadded, read with or without padding.
const B64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Raw,
    B64,
    Z64,
    A85,
    Z85,
}

impl Encoding {
    pub const ALL: [Encoding; 5] = [Self::Raw, Self::B64, Self::Z64, Self::A85, Self::Z85];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::B64 => "b64",
            Self::Z64 => "z64",
            Self::A85 => "a85",
            Self::Z85 => "z85",
        }
    }
}

impl FromStr for Encoding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| Error::InvalidEncoding(format!("unknown scheme '{s}'")))
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn decode_err(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput | io::ErrorKind::UnexpectedEof => {
            Error::InvalidEncoding(e.to_string())
        }
        _ => Error::Io(e),
    }
}

/// Streams `reader` through `encoding` into `writer`, returning the writer.
pub fn encode_to<R: Read, W: Write>(mut reader: R, writer: W, encoding: Encoding) -> Result<W> {
    let writer = match encoding {
        Encoding::Raw => {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            let text = String::from_utf8(buf).map_err(|_| {
                Error::InvalidEncoding("raw payload is not valid UTF-8".to_string())
            })?;
            let mut writer = writer;
            writer.write_all(text.as_bytes())?;
            writer
        }
        Encoding::B64 => {
            let mut enc = base64::write::EncoderWriter::new(writer, &B64);
            io::copy(&mut reader, &mut enc)?;
            enc.finish()?
        }
        Encoding::Z64 => {
            let enc = base64::write::EncoderWriter::new(writer, &B64);
            let mut gz = GzEncoder::new(enc, Compression::best());
            io::copy(&mut reader, &mut gz)?;
            gz.finish()?.finish()?
        }
        Encoding::A85 => {
            let mut enc = Ascii85Encoder::new(writer);
            io::copy(&mut reader, &mut enc)?;
            enc.finish()?
        }
        Encoding::Z85 => {
            let enc = Ascii85Encoder::new(writer);
            let mut gz = GzEncoder::new(enc, Compression::best());
            io::copy(&mut reader, &mut gz)?;
            gz.finish()?.finish()?
        }
    };
    Ok(writer)
}

/// Encodes everything `reader` yields into a payload string.
pub fn encode<R: Read>(reader: R, encoding: Encoding) -> Result<String> {
    let bytes = encode_to(reader, Vec::new(), encoding)?;
    String::from_utf8(bytes)
        .map_err(|_| Error::InvalidEncoding(format!("{encoding} produced non-text output")))
}

/// Returns a reader yielding the decoded bytes of the payload text read from
/// `payload`.
///
/// Gzip input is read as a single member; anything after the first member's
/// trailer is ignored.
pub fn decoder<'a, R: Read + 'a>(payload: R, encoding: Encoding) -> Box<dyn Read + 'a> {
    match encoding {
        Encoding::Raw => Box::new(payload),
        Encoding::B64 => Box::new(base64::read::DecoderReader::new(payload, &B64)),
        Encoding::Z64 => Box::new(GzDecoder::new(base64::read::DecoderReader::new(
            payload, &B64,
        ))),
        Encoding::A85 => Box::new(Ascii85Decoder::new(payload)),
        Encoding::Z85 => Box::new(GzDecoder::new(Ascii85Decoder::new(payload))),
    }
}

/// Streams payload text from `payload` through the decoder into `writer`,
/// returning the decoded byte count.
pub fn decode_from<R: Read, W: Write + ?Sized>(
    payload: R,
    encoding: Encoding,
    writer: &mut W,
) -> Result<u64> {
    let mut reader = decoder(payload, encoding);
    io::copy(&mut reader, writer).map_err(decode_err)
}

/// Streams the decoded bytes of `payload` into `writer`, returning the count.
pub fn decode_to<W: Write + ?Sized>(payload: &str, encoding: Encoding, writer: &mut W) -> Result<u64> {
    decode_from(payload.as_bytes(), encoding, writer)
}

pub fn decode(payload: &str, encoding: Encoding) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    decode_to(payload, encoding, &mut out)?;
    Ok(out)
}
