use std::{
    fs::File,
    io::{self, BufReader, Read},
    path::Path,
};

use byteorder::{BigEndian, ReadBytesExt};
use flate2::read::GzDecoder;
use nalgebra::DMatrix;
use tracing::{debug, info};

use crate::{
    dataset::Dataset,
    error::{MnistError, Result},
};

pub const CLASSES: usize = 10;

const IMAGES_MAGIC: u32 = 0x0000_0803;
const LABELS_MAGIC: u32 = 0x0000_0801;

#[derive(Clone, Copy, Debug, PartialEq)]
enum DataType {
    UnsignedByte,
    SignedByte,
    Short,
    Int,
    Float,
    Double,
    Unknown,
}

impl From<u32> for DataType {
    fn from(v: u32) -> Self {
        match (v >> 8) & 0xFF {
            0x08 => Self::UnsignedByte,
            0x09 => Self::SignedByte,
            0x0B => Self::Short,
            0x0C => Self::Int,
            0x0D => Self::Float,
            0x0E => Self::Double,
            _ => Self::Unknown,
        }
    }
}

/// Reads the magic number and checks it matches `expected`.
fn read_magic(src: &mut impl Read, expected: u32) -> Result<()> {
    let magic = src.read_u32::<BigEndian>()?;
    let data_type = DataType::from(magic);
    let data_dims = magic & 0xFF;

    if data_type != DataType::UnsignedByte || data_dims != expected & 0xFF || magic >> 16 != 0 {
        debug!(?data_type, data_dims, "unexpected IDX header");

        return Err(MnistError::InvalidMagic {
            expected,
            got: magic,
        }
        .into());
    }

    Ok(())
}

/// Reads exactly `len` payload bytes, growing the buffer only as data arrives.
fn read_payload(src: &mut impl Read, len: usize) -> Result<Vec<u8>> {
    let mut data = Vec::new();

    src.by_ref().take(len as u64).read_to_end(&mut data)?;

    if data.len() != len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("expected {len} bytes of IDX data, found {}", data.len()),
        )
        .into());
    }

    Ok(data)
}

#[derive(Debug)]
struct RawImages {
    image_len: usize,
    data: Vec<u8>,
}

impl RawImages {
    fn parse(src: &mut impl Read) -> Result<Self> {
        read_magic(src, IMAGES_MAGIC)?;

        let count = src.read_u32::<BigEndian>()?;
        let d1 = src.read_u32::<BigEndian>()?;
        let d2 = src.read_u32::<BigEndian>()?;
        let invalid = || MnistError::InvalidDims {
            count,
            rows: d1,
            cols: d2,
        };

        let image_len = (d1 as usize).checked_mul(d2 as usize).ok_or_else(invalid)?;
        let total = image_len.checked_mul(count as usize).ok_or_else(invalid)?;
        let data = read_payload(src, total)?;

        Ok(RawImages {
            image_len,
            data,
        })
    }

    fn image_len(&self) -> usize {
        self.image_len
    }

    fn count(&self) -> usize {
        self.data.len() / self.image_len().max(1)
    }

    fn split_off(&mut self, at: usize) -> Self {
        let at = at.saturating_mul(self.image_len()).min(self.data.len());

        RawImages {
            image_len: self.image_len,
            data: self.data.split_off(at),
        }
    }

    fn into_matrix(self, normalize: bool) -> DMatrix<f32> {
        let divisor = if normalize { 255.0 } else { 1.0 };
        let rows = self.count();
        let cols = self.image_len();
        let pixels: Vec<f32> = self.data.into_iter().map(|v| v as f32 / divisor).collect();

        DMatrix::from_row_slice(rows, cols, &pixels)
    }
}

#[derive(Debug)]
struct RawLabels(Vec<u8>);

impl RawLabels {
    fn parse(src: &mut impl Read) -> Result<Self> {
        read_magic(src, LABELS_MAGIC)?;

        let count = src.read_u32::<BigEndian>()?;

        Ok(RawLabels(read_payload(src, count as usize)?))
    }

    fn split_off(&mut self, at: usize) -> RawLabels {
        let at = at.min(self.0.len());

        RawLabels(self.0.split_off(at))
    }
}

fn to_dataset(images: RawImages, labels: RawLabels, normalize: bool) -> Result<Dataset> {
    Dataset::new(images.into_matrix(normalize), labels.0, CLASSES)
}

/// Opens `dir/name.gz` through a gzip decoder, falling back to the
/// uncompressed `dir/name`.
fn open_idx(dir: &Path, name: &str) -> Result<Box<dyn Read>> {
    let gz = dir.join(format!("{name}.gz"));

    if gz.is_file() {
        return Ok(Box::new(GzDecoder::new(BufReader::new(File::open(gz)?))));
    }

    let raw = dir.join(name);

    if raw.is_file() {
        return Ok(Box::new(BufReader::new(File::open(raw)?)));
    }

    Err(MnistError::MissingFile(dir.join(name).display().to_string()).into())
}

#[derive(Clone, Copy, Debug)]
pub struct LoadOptions {
    /// Scale pixels from 0..=255 to 0.0..=1.0.
    pub normalize: bool,
    /// Training images moved to the validation set, taken from the end.
    pub validation_size: usize,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            normalize: true,
            validation_size: 0,
        }
    }
}

#[derive(Debug)]
pub struct MnistData {
    pub training: Dataset,
    pub validation: Dataset,
    pub test: Dataset,
}

impl MnistData {
    /// Loads the four standard MNIST files from `dir`, gzipped or not.
    pub fn load(dir: &Path, options: LoadOptions) -> Result<Self> {
        info!(dir = %dir.display(), "loading MNIST");

        let mut train_images = RawImages::parse(&mut open_idx(dir, "train-images-idx3-ubyte")?)?;
        let mut train_labels = RawLabels::parse(&mut open_idx(dir, "train-labels-idx1-ubyte")?)?;
        let test_images = RawImages::parse(&mut open_idx(dir, "t10k-images-idx3-ubyte")?)?;
        let test_labels = RawLabels::parse(&mut open_idx(dir, "t10k-labels-idx1-ubyte")?)?;

        let keep = train_images.count().saturating_sub(options.validation_size);
        let validation_images = train_images.split_off(keep);
        let validation_labels = train_labels.split_off(keep);

        let data = Self {
            training: to_dataset(train_images, train_labels, options.normalize)?,
            validation: to_dataset(validation_images, validation_labels, options.normalize)?,
            test: to_dataset(test_images, test_labels, options.normalize)?,
        };

        info!(
            training = data.training.len(),
            validation = data.validation.len(),
            test = data.test.len(),
            "MNIST loaded"
        );

        Ok(data)
    }
}
