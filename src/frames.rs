//! Contiguous batch buffers with explicit shape bookkeeping.
//!
//! [`Frames`] holds continuous data laid out `[batch, channels, time]`
//! row-major, the same layout as a `B x D x T` tensor. [`Codes`] holds the
//! integer tokens laid out `[batch, n_codebooks, time]`.
//!
//! The quantizer works on an "encodings" view where batch and time are
//! flattened into one axis: row `b * time + t` holds the `channels` values
//! of frame `t` of sample `b`.

use candle_core::{DType, Device, Tensor};

use crate::{Error, Result};

/// Continuous `[batch, channels, time]` buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Frames {
    data: Vec<f32>,
    batch: usize,
    channels: usize,
    time: usize,
}

impl Frames {
    pub fn new(data: Vec<f32>, batch: usize, channels: usize, time: usize) -> Result<Self> {
        let expected = batch * channels * time;
        if data.len() != expected {
            return Err(Error::Shape(format!(
                "expected {batch}x{channels}x{time} = {expected} values, got {}",
                data.len()
            )));
        }
        Ok(Self {
            data,
            batch,
            channels,
            time,
        })
    }

    pub fn zeros(batch: usize, channels: usize, time: usize) -> Self {
        Self {
            data: vec![0.0; batch * channels * time],
            batch,
            channels,
            time,
        }
    }

    /// `(batch, channels, time)`.
    pub fn dims(&self) -> (usize, usize, usize) {
        (self.batch, self.channels, self.time)
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn time(&self) -> usize {
        self.time
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    #[inline]
    fn offset(&self, b: usize, c: usize, t: usize) -> usize {
        (b * self.channels + c) * self.time + t
    }

    #[inline]
    pub fn get(&self, b: usize, c: usize, t: usize) -> f32 {
        self.data[self.offset(b, c, t)]
    }

    /// Values of sample `b`, i.e. a `[channels, time]` block.
    pub fn sample(&self, b: usize) -> &[f32] {
        let len = self.channels * self.time;
        &self.data[b * len..(b + 1) * len]
    }

    /// Flatten to `(batch * time) x channels` encodings (`b d t -> (b t) d`).
    pub fn to_encodings(&self) -> Vec<f32> {
        let mut out = vec![0.0f32; self.data.len()];
        for b in 0..self.batch {
            for c in 0..self.channels {
                let src = self.offset(b, c, 0);
                for t in 0..self.time {
                    out[(b * self.time + t) * self.channels + c] = self.data[src + t];
                }
            }
        }
        out
    }

    /// Inverse of [`Frames::to_encodings`] (`(b t) d -> b d t`).
    pub fn from_encodings(
        encodings: &[f32],
        batch: usize,
        channels: usize,
        time: usize,
    ) -> Result<Self> {
        let mut frames = Self::zeros(batch, channels, time);
        if encodings.len() != frames.data.len() {
            return Err(Error::Shape(format!(
                "expected {} encoding values for {batch}x{channels}x{time}, got {}",
                frames.data.len(),
                encodings.len()
            )));
        }
        for b in 0..batch {
            for t in 0..time {
                let row = &encodings[(b * time + t) * channels..(b * time + t + 1) * channels];
                for (c, &v) in row.iter().enumerate() {
                    let dst = frames.offset(b, c, t);
                    frames.data[dst] = v;
                }
            }
        }
        Ok(frames)
    }

    /// Copy of channels `start..start + len`.
    pub fn narrow_channels(&self, start: usize, len: usize) -> Result<Self> {
        if start + len > self.channels {
            return Err(Error::Shape(format!(
                "channel range {start}..{} exceeds {} channels",
                start + len,
                self.channels
            )));
        }
        let mut data = Vec::with_capacity(self.batch * len * self.time);
        for b in 0..self.batch {
            let from = self.offset(b, start, 0);
            data.extend_from_slice(&self.data[from..from + len * self.time]);
        }
        Ok(Self {
            data,
            batch: self.batch,
            channels: len,
            time: self.time,
        })
    }

    /// Concatenate along the channel axis.
    pub fn cat_channels(parts: &[Frames]) -> Result<Self> {
        let Some(first) = parts.first() else {
            return Err(Error::Shape("cannot concatenate zero buffers".into()));
        };
        let (batch, time) = (first.batch, first.time);
        if let Some(bad) = parts.iter().find(|p| p.batch != batch || p.time != time) {
            return Err(Error::Shape(format!(
                "cannot concatenate {:?} with batch {batch} / time {time}",
                bad.dims()
            )));
        }
        let channels = parts.iter().map(|p| p.channels).sum();
        let mut data = Vec::with_capacity(batch * channels * time);
        for b in 0..batch {
            for part in parts {
                data.extend_from_slice(part.sample(b));
            }
        }
        Ok(Self {
            data,
            batch,
            channels,
            time,
        })
    }

    fn check_same_dims(&self, other: &Frames) -> Result<()> {
        if self.dims() != other.dims() {
            return Err(Error::Shape(format!(
                "dimension mismatch: {:?} vs {:?}",
                self.dims(),
                other.dims()
            )));
        }
        Ok(())
    }

    /// `self += other`.
    pub fn add_assign(&mut self, other: &Frames) -> Result<()> {
        self.check_same_dims(other)?;
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += b;
        }
        Ok(())
    }

    /// `self -= other`.
    pub fn sub_assign(&mut self, other: &Frames) -> Result<()> {
        self.check_same_dims(other)?;
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a -= b;
        }
        Ok(())
    }

    /// `self += other` for the samples whose `mask` entry is set.
    pub fn add_masked(&mut self, other: &Frames, mask: &[bool]) -> Result<()> {
        self.check_same_dims(other)?;
        if mask.len() != self.batch {
            return Err(Error::Shape(format!(
                "mask has {} entries for batch {}",
                mask.len(),
                self.batch
            )));
        }
        let len = self.channels * self.time;
        for (b, _) in mask.iter().enumerate().filter(|(_, on)| **on) {
            let range = b * len..(b + 1) * len;
            for (a, v) in self.data[range.clone()].iter_mut().zip(&other.data[range]) {
                *a += v;
            }
        }
        Ok(())
    }

    /// Largest absolute element-wise difference.
    pub fn max_abs_diff(&self, other: &Frames) -> Result<f32> {
        self.check_same_dims(other)?;
        Ok(self
            .data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f32::max))
    }

    /// Read a `[batch, channels, time]` tensor of any float dtype.
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let (batch, channels, time) = tensor.dims3()?;
        let data = tensor
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        Self::new(data, batch, channels, time)
    }

    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_slice(
            &self.data,
            (self.batch, self.channels, self.time),
            device,
        )?)
    }
}

/// Integer codes laid out `[batch, n_codebooks, time]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Codes {
    data: Vec<u32>,
    batch: usize,
    n_codebooks: usize,
    time: usize,
}

impl Codes {
    pub fn new(data: Vec<u32>, batch: usize, n_codebooks: usize, time: usize) -> Result<Self> {
        let expected = batch * n_codebooks * time;
        if data.len() != expected {
            return Err(Error::Shape(format!(
                "expected {batch}x{n_codebooks}x{time} = {expected} codes, got {}",
                data.len()
            )));
        }
        Ok(Self {
            data,
            batch,
            n_codebooks,
            time,
        })
    }

    /// Stack per-stage indices, each in `(b t)` order, into `[batch, N, time]`.
    pub fn from_stages(stages: &[Vec<u32>], batch: usize, time: usize) -> Result<Self> {
        let n_codebooks = stages.len();
        let mut data = vec![0u32; batch * n_codebooks * time];
        for (n, stage) in stages.iter().enumerate() {
            if stage.len() != batch * time {
                return Err(Error::Shape(format!(
                    "stage {n} has {} codes, expected {}",
                    stage.len(),
                    batch * time
                )));
            }
            for b in 0..batch {
                let dst = (b * n_codebooks + n) * time;
                data[dst..dst + time].copy_from_slice(&stage[b * time..(b + 1) * time]);
            }
        }
        Self::new(data, batch, n_codebooks, time)
    }

    /// `(batch, n_codebooks, time)`.
    pub fn dims(&self) -> (usize, usize, usize) {
        (self.batch, self.n_codebooks, self.time)
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn n_codebooks(&self) -> usize {
        self.n_codebooks
    }

    pub fn time(&self) -> usize {
        self.time
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.data
    }

    #[inline]
    pub fn get(&self, b: usize, n: usize, t: usize) -> u32 {
        self.data[(b * self.n_codebooks + n) * self.time + t]
    }

    /// Indices of stage `n` in `(b t)` order.
    pub fn stage(&self, n: usize) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.batch * self.time);
        for b in 0..self.batch {
            let from = (b * self.n_codebooks + n) * self.time;
            out.extend_from_slice(&self.data[from..from + self.time]);
        }
        out
    }

    /// Read a `[batch, n_codebooks, time]` integer tensor.
    ///
    /// Negative values in signed tensors are rejected rather than wrapped.
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let (batch, n_codebooks, time) = tensor.dims3()?;
        let data = match tensor.dtype() {
            DType::U32 => tensor.flatten_all()?.to_vec1::<u32>()?,
            DType::U8 => tensor
                .flatten_all()?
                .to_vec1::<u8>()?
                .into_iter()
                .map(u32::from)
                .collect(),
            _ => tensor
                .to_dtype(DType::I64)?
                .flatten_all()?
                .to_vec1::<i64>()?
                .into_iter()
                .map(|v| {
                    u32::try_from(v).map_err(|_| Error::Shape(format!("invalid code value {v}")))
                })
                .collect::<Result<Vec<_>>>()?,
        };
        Self::new(data, batch, n_codebooks, time)
    }

    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_slice(
            &self.data,
            (self.batch, self.n_codebooks, self.time),
            device,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(batch: usize, channels: usize, time: usize) -> Frames {
        let data = (0..batch * channels * time).map(|i| i as f32).collect();
        Frames::new(data, batch, channels, time).unwrap()
    }

    #[test]
    fn test_new_rejects_wrong_length() {
        assert!(matches!(
            Frames::new(vec![0.0; 5], 1, 2, 3),
            Err(Error::Shape(_))
        ));
    }

    #[test]
    fn test_encodings_layout() {
        // [b=1, c=2, t=3]: channel 0 = [0, 1, 2], channel 1 = [3, 4, 5]
        let frames = ramp(1, 2, 3);
        let enc = frames.to_encodings();
        // Row t holds (c0[t], c1[t])
        assert_eq!(enc, vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);

        let back = Frames::from_encodings(&enc, 1, 2, 3).unwrap();
        assert_eq!(back, frames);
    }

    #[test]
    fn test_encodings_batch_major() {
        let frames = ramp(2, 1, 2);
        // Rows ordered (b0,t0), (b0,t1), (b1,t0), (b1,t1)
        assert_eq!(frames.to_encodings(), vec![0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_narrow_and_cat_channels() {
        let frames = ramp(2, 3, 2);
        let head = frames.narrow_channels(0, 2).unwrap();
        let tail = frames.narrow_channels(2, 1).unwrap();
        assert_eq!(head.dims(), (2, 2, 2));
        assert_eq!(tail.get(1, 0, 1), frames.get(1, 2, 1));
        let joined = Frames::cat_channels(&[head, tail]).unwrap();
        assert_eq!(joined, frames);

        assert!(frames.narrow_channels(2, 2).is_err());
    }

    #[test]
    fn test_add_masked_only_touches_selected_samples() {
        let mut acc = Frames::zeros(2, 1, 2);
        let ones = Frames::new(vec![1.0; 4], 2, 1, 2).unwrap();
        acc.add_masked(&ones, &[false, true]).unwrap();
        assert_eq!(acc.as_slice(), &[0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_tensor_roundtrip() {
        let frames = ramp(2, 3, 4);
        let tensor = frames.to_tensor(&Device::Cpu).unwrap();
        assert_eq!(tensor.dims(), &[2, 3, 4]);
        assert_eq!(tensor.to_vec3::<f32>().unwrap()[1][2][3], frames.get(1, 2, 3));
        assert_eq!(Frames::from_tensor(&tensor).unwrap(), frames);
    }

    #[test]
    fn test_codes_from_stages() {
        // batch 2, time 2, two stages
        let stages = vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8]];
        let codes = Codes::from_stages(&stages, 2, 2).unwrap();
        assert_eq!(codes.dims(), (2, 2, 2));
        assert_eq!(codes.as_slice(), &[1, 2, 5, 6, 3, 4, 7, 8]);
        assert_eq!(codes.get(1, 0, 0), 3);
        assert_eq!(codes.stage(1), stages[1]);
    }

    #[test]
    fn test_codes_from_signed_tensor() {
        let t = Tensor::new(&[[[0i64, 3], [1, 2]]], &Device::Cpu).unwrap();
        let codes = Codes::from_tensor(&t).unwrap();
        assert_eq!(codes.as_slice(), &[0, 3, 1, 2]);

        let bad = Tensor::new(&[[[0i64, -1]]], &Device::Cpu).unwrap();
        assert!(Codes::from_tensor(&bad).is_err());
    }
}
