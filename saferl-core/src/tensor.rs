use anyhow::Result;
use candle_core::{Device, Tensor};

/// Backend independent tensor exchanged with environments.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTensor {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
}

impl RawTensor {
    pub fn from_vec(data: Vec<f32>) -> Self {
        let shape = vec![data.len()];
        Self { data, shape }
    }

    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        Self { data, shape }
    }

    pub fn to_data(self) -> Vec<f32> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Element wise clamp, `min` and `max` must have the same length as `self`.
    pub fn clamp(&self, min: &Self, max: &Self) -> Self {
        let data = self
            .data
            .iter()
            .zip(min.data.iter().zip(max.data.iter()))
            .map(|(x, (lo, hi))| x.max(*lo).min(*hi))
            .collect();
        Self {
            data,
            shape: self.shape.clone(),
        }
    }

    /// Index of the hot entry of a one-hot encoded discrete action.
    pub fn argmax(&self) -> usize {
        self.data
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |(best_idx, best), (idx, x)| {
                if *x > best { (idx, *x) } else { (best_idx, best) }
            })
            .0
    }

    pub fn to_candle_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_slice(&self.data, self.shape.as_slice(), device)?)
    }

    pub fn from_candle_tensor(tensor: &Tensor) -> Result<Self> {
        let shape = tensor.dims().to_vec();
        let data: Vec<f32> = tensor.flatten_all()?.to_vec1()?;
        Ok(Self { data, shape })
    }
}

/// Stacks flat tensors into a `[n, dim]` candle tensor.
pub fn stack_raw(tensors: &[RawTensor], device: &Device) -> Result<Tensor> {
    let dim = tensors.first().map(|t| t.len()).unwrap_or(0);
    let data: Vec<f32> = tensors.iter().flat_map(|t| t.data.iter().copied()).collect();
    Ok(Tensor::from_vec(data, (tensors.len(), dim), device)?)
}

/// Splits a `[n, dim]` candle tensor into `n` flat tensors.
pub fn unstack_raw(tensor: &Tensor) -> Result<Vec<RawTensor>> {
    let rows: Vec<Vec<f32>> = tensor.to_vec2()?;
    Ok(rows.into_iter().map(RawTensor::from_vec).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_and_argmax() {
        let t = RawTensor::from_vec(vec![-2., 0.5, 3.]);
        let min = RawTensor::from_vec(vec![-1., -1., -1.]);
        let max = RawTensor::from_vec(vec![1., 1., 1.]);
        assert_eq!(t.clamp(&min, &max).data, vec![-1., 0.5, 1.]);
        assert_eq!(RawTensor::from_vec(vec![0., 1., 0.]).argmax(), 1);
    }

    #[test]
    fn stacks_to_candle() -> Result<()> {
        let rows = vec![
            RawTensor::from_vec(vec![1., 2.]),
            RawTensor::from_vec(vec![3., 4.]),
        ];
        let stacked = stack_raw(&rows, &Device::Cpu)?;
        assert_eq!(stacked.dims(), &[2, 2]);
        assert_eq!(unstack_raw(&stacked)?, rows);
        Ok(())
    }
}
