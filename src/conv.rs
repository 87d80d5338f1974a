//! Convolution and pooling on top of im2col.
//!
//! Image batches are `N × C·H·W` matrices, each row laid out channel by
//! channel, then row by row.

use nalgebra::DMatrix;
use rayon::prelude::*;

use crate::{
    error::{Error, Result},
    layer::{add_bias, column_sums, Layer, Param},
};

/// Shape of a single image: channels, height, width.
pub type ImageShape = (usize, usize, usize);

/// Sliding-window geometry shared by convolution filters and pooling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
    pub filter_h: usize,
    pub filter_w: usize,
    pub stride: usize,
    pub pad: usize,
}

impl Window {
    /// `(OH, OW)` for an `h × w` input. Partial windows at the far edge are
    /// dropped.
    pub fn output_hw(&self, h: usize, w: usize) -> Result<(usize, usize)> {
        Ok((
            Self::output_len(h, self.filter_h, self.stride, self.pad)?,
            Self::output_len(w, self.filter_w, self.stride, self.pad)?,
        ))
    }

    fn output_len(input: usize, filter: usize, stride: usize, pad: usize) -> Result<usize> {
        if stride == 0 || filter == 0 {
            return Err(Error::InvalidGeometry(format!(
                "filter ({filter}) and stride ({stride}) must be positive"
            )));
        }

        let padded = input + 2 * pad;

        if padded < filter {
            return Err(Error::InvalidGeometry(format!(
                "filter of {filter} doesn't fit input of {input} padded by {pad}"
            )));
        }

        Ok((padded - filter) / stride + 1)
    }
}

fn check_batch(op: &'static str, x: &DMatrix<f32>, (c, h, w): ImageShape) -> Result<()> {
    if x.ncols() != c * h * w {
        return Err(Error::shape(op, (x.nrows(), c * h * w), x.shape()));
    }

    Ok(())
}

/// Unrolls every receptive field into a row: `N × C·H·W` becomes
/// `(N·OH·OW) × (C·FH·FW)`. Padding reads as zero.
pub fn im2col(input: &DMatrix<f32>, shape: ImageShape, window: &Window) -> Result<DMatrix<f32>> {
    check_batch("im2col", input, shape)?;

    let (c, h, w) = shape;
    let (oh, ow) = window.output_hw(h, w)?;
    let Window {
        filter_h: fh,
        filter_w: fw,
        stride,
        pad,
    } = *window;
    let n = input.nrows();
    let cols = c * fh * fw;
    let per_image = oh * ow * cols;

    if n == 0 || per_image == 0 {
        return Ok(DMatrix::zeros(n * oh * ow, cols));
    }

    let mut buf = vec![0.0; n * per_image];

    buf.par_chunks_mut(per_image)
        .enumerate()
        .for_each(|(img, out)| {
            for (p, row) in out.chunks_mut(cols).enumerate() {
                let (oy, ox) = (p / ow, p % ow);

                for ch in 0..c {
                    for ky in 0..fh {
                        let y = (oy * stride + ky) as isize - pad as isize;

                        if y < 0 || y >= h as isize {
                            continue;
                        }

                        for kx in 0..fw {
                            let x = (ox * stride + kx) as isize - pad as isize;

                            if x < 0 || x >= w as isize {
                                continue;
                            }

                            row[(ch * fh + ky) * fw + kx] =
                                input[(img, (ch * h + y as usize) * w + x as usize)];
                        }
                    }
                }
            }
        });

    Ok(DMatrix::from_row_slice(n * oh * ow, cols, &buf))
}

/// Folds unrolled rows back into `N × C·H·W`, summing where receptive fields
/// overlap. The adjoint of [`im2col`].
pub fn col2im(
    col: &DMatrix<f32>,
    n: usize,
    shape: ImageShape,
    window: &Window,
) -> Result<DMatrix<f32>> {
    let (c, h, w) = shape;
    let (oh, ow) = window.output_hw(h, w)?;
    let Window {
        filter_h: fh,
        filter_w: fw,
        stride,
        pad,
    } = *window;
    let cols = c * fh * fw;

    if col.shape() != (n * oh * ow, cols) {
        return Err(Error::shape("col2im", (n * oh * ow, cols), col.shape()));
    }

    let image_len = c * h * w;

    if n == 0 || image_len == 0 {
        return Ok(DMatrix::zeros(n, image_len));
    }

    let mut buf = vec![0.0; n * image_len];

    buf.par_chunks_mut(image_len)
        .enumerate()
        .for_each(|(img, out)| {
            for p in 0..oh * ow {
                let (oy, ox) = (p / ow, p % ow);
                let row = img * oh * ow + p;

                for ch in 0..c {
                    for ky in 0..fh {
                        let y = (oy * stride + ky) as isize - pad as isize;

                        if y < 0 || y >= h as isize {
                            continue;
                        }

                        for kx in 0..fw {
                            let x = (ox * stride + kx) as isize - pad as isize;

                            if x < 0 || x >= w as isize {
                                continue;
                            }

                            out[(ch * h + y as usize) * w + x as usize] +=
                                col[(row, (ch * fh + ky) * fw + kx)];
                        }
                    }
                }
            }
        });

    Ok(DMatrix::from_row_slice(n, image_len, &buf))
}

/// `(N·P) × F` (one row per output position) to `N × F·P` (channel-major).
fn positions_to_channels(m: &DMatrix<f32>, n: usize, positions: usize) -> DMatrix<f32> {
    let f = m.ncols();

    DMatrix::from_fn(n, f * positions, |img, j| {
        let (ch, p) = (j / positions, j % positions);

        m[(img * positions + p, ch)]
    })
}

/// Inverse of [`positions_to_channels`].
fn channels_to_positions(m: &DMatrix<f32>, channels: usize, positions: usize) -> DMatrix<f32> {
    let n = m.nrows();

    DMatrix::from_fn(n * positions, channels, |r, ch| {
        let (img, p) = (r / positions, r % positions);

        m[(img, ch * positions + p)]
    })
}

#[derive(Debug)]
struct ConvCache {
    n: usize,
    col: DMatrix<f32>,
}

/// 2D convolution. `weight` is `FN × C·FH·FW` (one flattened filter per row)
/// and `bias` is `1 × FN`.
#[derive(Debug)]
pub struct Convolution {
    weight: Param,
    bias: Param,
    input_shape: ImageShape,
    window: Window,
    output_shape: ImageShape,
    cache: Option<ConvCache>,
}

impl Convolution {
    pub fn new(weight: Param, bias: Param, input_shape: ImageShape, window: Window) -> Result<Self> {
        let (c, h, w) = input_shape;
        let filters = weight.shape().0;
        let expected = (filters, c * window.filter_h * window.filter_w);

        if weight.shape() != expected {
            return Err(Error::shape("Convolution::new", expected, weight.shape()));
        }

        if bias.shape() != (1, filters) {
            return Err(Error::shape("Convolution::new", (1, filters), bias.shape()));
        }

        let (oh, ow) = window.output_hw(h, w)?;

        Ok(Self {
            weight,
            bias,
            input_shape,
            window,
            output_shape: (filters, oh, ow),
            cache: None,
        })
    }

    /// `(FN, OH, OW)`.
    pub fn output_shape(&self) -> ImageShape {
        self.output_shape
    }
}

impl Layer for Convolution {
    fn kind(&self) -> &'static str {
        "Convolution"
    }

    fn forward(&mut self, x: &DMatrix<f32>, _train: bool) -> Result<DMatrix<f32>> {
        let col = im2col(x, self.input_shape, &self.window)?;
        let mut out = &col * self.weight.value.transpose();

        add_bias(&mut out, &self.bias.value);

        let (_, oh, ow) = self.output_shape;
        let out = positions_to_channels(&out, x.nrows(), oh * ow);

        self.cache = Some(ConvCache { n: x.nrows(), col });

        Ok(out)
    }

    fn backward(&mut self, dout: &DMatrix<f32>) -> Result<DMatrix<f32>> {
        let ConvCache { n, col } = self
            .cache
            .as_ref()
            .ok_or(Error::BackwardBeforeForward("Convolution"))?;
        let (filters, oh, ow) = self.output_shape;

        if dout.shape() != (*n, filters * oh * ow) {
            return Err(Error::shape(
                "Convolution::backward",
                (*n, filters * oh * ow),
                dout.shape(),
            ));
        }

        let dout = channels_to_positions(dout, filters, oh * ow);

        self.bias.grad = column_sums(&dout);
        self.weight.grad = dout.transpose() * col;

        let dcol = dout * &self.weight.value;

        col2im(&dcol, *n, self.input_shape, &self.window)
    }

    fn params(&self) -> Vec<&Param> {
        vec![&self.weight, &self.bias]
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.weight, &mut self.bias]
    }
}

#[derive(Debug)]
struct PoolCache {
    n: usize,
    argmax: Vec<usize>,
}

/// Max pooling applied to each channel independently.
#[derive(Debug)]
pub struct Pooling {
    input_shape: ImageShape,
    window: Window,
    output_shape: ImageShape,
    cache: Option<PoolCache>,
}

impl Pooling {
    pub fn new(input_shape: ImageShape, window: Window) -> Result<Self> {
        let (c, h, w) = input_shape;
        let (oh, ow) = window.output_hw(h, w)?;

        Ok(Self {
            input_shape,
            window,
            output_shape: (c, oh, ow),
            cache: None,
        })
    }

    pub fn output_shape(&self) -> ImageShape {
        self.output_shape
    }
}

impl Layer for Pooling {
    fn kind(&self) -> &'static str {
        "Pooling"
    }

    fn forward(&mut self, x: &DMatrix<f32>, _train: bool) -> Result<DMatrix<f32>> {
        let col = im2col(x, self.input_shape, &self.window)?;
        let (c, oh, ow) = self.output_shape;
        let area = self.window.filter_h * self.window.filter_w;
        let positions = oh * ow;
        let n = x.nrows();
        let mut out = DMatrix::zeros(n, c * positions);
        let mut argmax = vec![0; col.nrows() * c];

        for r in 0..col.nrows() {
            let (img, p) = (r / positions, r % positions);

            for ch in 0..c {
                let start = ch * area;
                let (best, value) = (start..start + area).fold((start, f32::NEG_INFINITY), |acc, j| {
                    if col[(r, j)] > acc.1 {
                        (j, col[(r, j)])
                    } else {
                        acc
                    }
                });

                argmax[r * c + ch] = best;
                out[(img, ch * positions + p)] = value;
            }
        }

        self.cache = Some(PoolCache { n, argmax });

        Ok(out)
    }

    fn backward(&mut self, dout: &DMatrix<f32>) -> Result<DMatrix<f32>> {
        let PoolCache { n, argmax } = self
            .cache
            .as_ref()
            .ok_or(Error::BackwardBeforeForward("Pooling"))?;
        let (c, oh, ow) = self.output_shape;
        let positions = oh * ow;

        if dout.shape() != (*n, c * positions) {
            return Err(Error::shape(
                "Pooling::backward",
                (*n, c * positions),
                dout.shape(),
            ));
        }

        let area = self.window.filter_h * self.window.filter_w;
        let mut dcol = DMatrix::zeros(n * positions, c * area);

        for r in 0..n * positions {
            let (img, p) = (r / positions, r % positions);

            for ch in 0..c {
                dcol[(r, argmax[r * c + ch])] = dout[(img, ch * positions + p)];
            }
        }

        col2im(&dcol, *n, self.input_shape, &self.window)
    }
}
