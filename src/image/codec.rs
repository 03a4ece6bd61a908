//! Image encoding and decoding
//!
//! Binary is the protobuf wire form; JSON uses camelCase field names, with
//! the undecoded descriptor fields of each file as one base64 string. Either
//! may be gzip-compressed.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use prost::Message;
use std::io::{Read, Write};

use super::Image;
use crate::error::Result;
use crate::reference::{Compression, ImageEncoding, ImageFormat};

/// Encode an image in the given format
pub fn encode_image(image: &Image, format: ImageFormat) -> Result<Vec<u8>> {
    let raw = match format.encoding {
        ImageEncoding::Binary => image.encode_to_vec(),
        ImageEncoding::Json => serde_json::to_vec(image)?,
    };
    match format.compression {
        Compression::None => Ok(raw),
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(&raw)?;
            Ok(encoder.finish()?)
        }
    }
}

/// Decode an image from bytes in the given format
pub fn decode_image(data: &[u8], format: ImageFormat) -> Result<Image> {
    let raw = match format.compression {
        Compression::None => std::borrow::Cow::Borrowed(data),
        Compression::Gzip => {
            let mut out = Vec::new();
            GzDecoder::new(data).read_to_end(&mut out)?;
            std::borrow::Cow::Owned(out)
        }
    };
    let image = match format.encoding {
        ImageEncoding::Binary => Image::decode(raw.as_ref())?,
        ImageEncoding::Json => serde_json::from_slice(&raw)?,
    };
    Ok(image)
}
