use nalgebra::DMatrix;

use crate::error::{Error, MnistError, Result};

/// Samples as rows of `images`, with class labels and their one-hot encoding.
#[derive(Clone, Debug)]
pub struct Dataset {
    pub images: DMatrix<f32>,
    pub labels: Vec<u8>,
    pub targets: DMatrix<f32>,
}

/// `N × classes` matrix with a single 1.0 per row.
pub fn one_hot(labels: &[u8], classes: usize) -> Result<DMatrix<f32>> {
    if let Some(&bad) = labels.iter().find(|&&l| l as usize >= classes) {
        return Err(Error::InvalidConfig(format!(
            "label {bad} out of range for {classes} classes"
        )));
    }

    Ok(DMatrix::from_fn(labels.len(), classes, |i, j| {
        if labels[i] as usize == j {
            1.0
        } else {
            0.0
        }
    }))
}

impl Dataset {
    pub fn new(images: DMatrix<f32>, labels: Vec<u8>, classes: usize) -> Result<Self> {
        if images.nrows() != labels.len() {
            return Err(MnistError::CountMismatch {
                images: images.nrows(),
                labels: labels.len(),
            }
            .into());
        }

        let targets = one_hot(&labels, classes)?;

        Ok(Self {
            images,
            labels,
            targets,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn features(&self) -> usize {
        self.images.ncols()
    }

    pub fn classes(&self) -> usize {
        self.targets.ncols()
    }

    /// The first `n` samples (all of them if there are fewer).
    pub fn take(&self, n: usize) -> Self {
        let n = n.min(self.len());

        Self {
            images: self.images.rows(0, n).into_owned(),
            labels: self.labels[..n].to_vec(),
            targets: self.targets.rows(0, n).into_owned(),
        }
    }

    /// Images and one-hot targets of the samples at `indices`.
    pub fn batch(&self, indices: &[usize]) -> (DMatrix<f32>, DMatrix<f32>) {
        (
            self.images.select_rows(indices),
            self.targets.select_rows(indices),
        )
    }
}
