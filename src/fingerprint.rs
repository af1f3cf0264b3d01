use anyhow::{bail, Result};
use img_hash::{HashAlg, HasherConfig};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 64-bit perceptual hash of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub u64);

impl Fingerprint {
    pub fn distance(&self, other: &Fingerprint) -> u32 {
        (self.0 ^ other.0).count_ones()
    }

    /// Positions of the set bits, lowest first.
    pub fn set_bits(&self) -> impl Iterator<Item = u32> + '_ {
        (0..64u32).filter(move |i| (self.0 >> i) & 1 == 1)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashKind {
    Mean,
    #[default]
    Gradient,
    VertGradient,
    Blockhash,
}

impl HashKind {
    fn alg(self) -> HashAlg {
        match self {
            HashKind::Mean => HashAlg::Mean,
            HashKind::Gradient => HashAlg::Gradient,
            HashKind::VertGradient => HashAlg::VertGradient,
            HashKind::Blockhash => HashAlg::Blockhash,
        }
    }
}

/// Decodes image bytes and hashes them to an 8x8 (64-bit) fingerprint.
#[derive(Debug, Clone, Copy)]
pub struct Fingerprinter {
    kind: HashKind,
    dct: bool,
}

impl Fingerprinter {
    pub fn new(kind: HashKind, dct: bool) -> Self {
        Self { kind, dct }
    }

    pub fn fingerprint(&self, bytes: &[u8]) -> Result<Fingerprint> {
        let img = image::load_from_memory(bytes)?;
        let mut cfg = HasherConfig::new().hash_alg(self.kind.alg()).hash_size(8, 8);
        if self.dct {
            cfg = cfg.preproc_dct();
        }
        let hash = cfg.to_hasher().hash_image(&img);
        let raw = hash.as_bytes();
        if raw.len() != 8 {
            bail!("expected 8 hash bytes, got {}", raw.len());
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(raw);
        Ok(Fingerprint(u64::from_be_bytes(buf)))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{DynamicImage, ImageBuffer, ImageOutputFormat, Rgb};

    /// Horizontal gradient with a bright square whose position depends on `variant`.
    pub(crate) fn sample_image(variant: u32) -> DynamicImage {
        let img = ImageBuffer::from_fn(96, 96, |x, y| {
            let ox = 8 + (variant * 23) % 56;
            let oy = 8 + (variant * 41) % 56;
            if x >= ox && x < ox + 24 && y >= oy && y < oy + 24 {
                Rgb([250u8, 250, 250])
            } else {
                let v = ((x * 255 / 96 + variant * 37) % 200) as u8;
                Rgb([v, v / 2, 255 - v])
            }
        });
        DynamicImage::ImageRgb8(img)
    }

    pub(crate) fn encode(img: &DynamicImage, fmt: ImageOutputFormat) -> Vec<u8> {
        let mut out = Vec::new();
        img.write_to(&mut out, fmt).unwrap();
        out
    }

    #[test]
    fn distance_counts_differing_bits() {
        assert_eq!(Fingerprint(0).distance(&Fingerprint(0)), 0);
        assert_eq!(Fingerprint(0b1011).distance(&Fingerprint(0b0001)), 2);
        assert_eq!(Fingerprint(u64::MAX).distance(&Fingerprint(0)), 64);
    }

    #[test]
    fn set_bits_lists_positions() {
        let bits: Vec<u32> = Fingerprint(0b1000_0101).set_bits().collect();
        assert_eq!(bits, vec![0, 2, 7]);
        assert_eq!(Fingerprint(0).set_bits().count(), 0);
        assert_eq!(Fingerprint(u64::MAX).set_bits().count(), 64);
    }

    #[test]
    fn reencoding_keeps_fingerprint_close() {
        let fp = Fingerprinter::new(HashKind::Gradient, false);
        let img = sample_image(3);
        let png = fp.fingerprint(&encode(&img, ImageOutputFormat::Png)).unwrap();
        let jpg = fp.fingerprint(&encode(&img, ImageOutputFormat::Jpeg(85))).unwrap();
        assert!(png.distance(&jpg) <= 6, "distance {}", png.distance(&jpg));
    }

    #[test]
    fn decodes_png_jpeg_and_bmp() {
        let fp = Fingerprinter::new(HashKind::Gradient, false);
        let img = sample_image(5);
        let png = fp.fingerprint(&encode(&img, ImageOutputFormat::Png)).unwrap();
        let jpg = fp.fingerprint(&encode(&img, ImageOutputFormat::Jpeg(90))).unwrap();
        let bmp = fp.fingerprint(&encode(&img, ImageOutputFormat::Bmp)).unwrap();
        assert_eq!(png, bmp);
        assert!(png.distance(&jpg) <= 6, "distance {}", png.distance(&jpg));
    }

    #[test]
    fn garbage_fails_to_decode() {
        let fp = Fingerprinter::new(HashKind::default(), false);
        assert!(fp.fingerprint(b"definitely not an image").is_err());
    }

    #[test]
    fn every_kind_yields_64_bits() {
        let bytes = encode(&sample_image(1), ImageOutputFormat::Png);
        for kind in [HashKind::Mean, HashKind::Gradient, HashKind::VertGradient, HashKind::Blockhash] {
            Fingerprinter::new(kind, false).fingerprint(&bytes).unwrap();
        }
        Fingerprinter::new(HashKind::Mean, true).fingerprint(&bytes).unwrap();
    }
}
