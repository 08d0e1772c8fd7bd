use candle_core::shape::Dim;
use candle_core::{DType, Device, Result, Shape, Tensor};

const EPSILON: f64 = 1e-8;

#[derive(Debug, Clone)]
pub struct RunningMeanStd {
    pub mean: Tensor,
    pub var: Tensor,
    pub count: f32,
    pub device: Device,
}

fn biased_var<D: Dim>(t: &Tensor, dim: D) -> Result<Tensor> {
    let dim = dim.to_index(t.shape(), "var")?;
    let mean = t.mean_keepdim(dim)?;
    let squares = t.broadcast_sub(&mean)?.sqr()?;
    (squares.sum_keepdim(dim)? / t.dim(dim)? as f64)?.squeeze(dim)
}

impl RunningMeanStd {
    pub fn new<S: Into<Shape> + Copy>(shape: S, device: Device) -> Result<Self> {
        let mean = Tensor::zeros(shape, DType::F32, &device)?;
        let var = Tensor::ones(shape, DType::F32, &device)?;
        Ok(Self {
            mean,
            var,
            count: 0.,
            device,
        })
    }

    /// Updates the statistics with a `[batch, ..shape]` tensor.
    pub fn update(&mut self, arr: &Tensor) -> Result<()> {
        let batch_mean = arr.mean(0)?;
        let batch_var = biased_var(arr, 0)?;
        let batch_count = arr.shape().dim(0)? as f32;
        self.update_from_moments(batch_mean, batch_var, batch_count)
    }

    // implements Welford's algorithm
    fn update_from_moments(
        &mut self,
        batch_mean: Tensor,
        batch_var: Tensor,
        batch_count: f32,
    ) -> Result<()> {
        let tot_count = self.count + batch_count;
        let delta = batch_mean.sub(&self.mean)?;
        self.mean = self
            .mean
            .add(&delta.affine((batch_count / tot_count) as f64, 0.)?)?;
        let m_a = self.var.affine(self.count as f64, 0.)?;
        let m_b = batch_var.affine(batch_count as f64, 0.)?;
        let m_2 = m_a
            .add(&m_b)?
            .add(&delta.sqr()?.affine((self.count * batch_count / tot_count) as f64, 0.)?)?;
        self.var = m_2.affine(1. / tot_count as f64, 0.)?;
        self.count = tot_count;
        Ok(())
    }

    pub fn std(&self) -> Result<Tensor> {
        self.var.affine(1., EPSILON)?.sqrt()
    }

    /// `(x - mean) / std` clipped to `[-clip, clip]`. Until two samples were seen the
    /// variance means nothing and `xs` is returned as is.
    pub fn normalize(&self, xs: &Tensor, clip: f32) -> Result<Tensor> {
        if self.count <= 1. {
            return Ok(xs.clone());
        }
        xs.broadcast_sub(&self.mean)?
            .broadcast_div(&self.std()?)?
            .clamp(-clip, clip)
    }
}

#[cfg(test)]
mod tests {
    use super::{RunningMeanStd, biased_var};
    use candle_core::{Device, Result, Tensor};
    use rand::Rng;

    #[test]
    fn test_biased_var() -> Result<()> {
        let test_t = Tensor::from_slice(
            &[
                0.48883059f32,
                0.48259816,
                0.79328812,
                0.19103859,
                0.11694599,
                0.53854045,
            ],
            (2, 3),
            &Device::Cpu,
        )?;
        let var = biased_var(&test_t, 0)?;
        let reference_var =
            Tensor::from_slice(&[0.02217002f32, 0.03342538, 0.01622409], 3, &Device::Cpu)?;
        let var_diff = (&var - &reference_var)?.abs()?.max(0)?;
        assert!(var_diff.to_scalar::<f32>()? < 1e-5, "var diff");
        Ok(())
    }

    #[test]
    fn test_running_mean_std_running() -> Result<()> {
        let device = Device::Cpu;
        let mut rng = rand::rng();
        let shape = (10, 3);
        let mut rms = RunningMeanStd::new(shape.1, device.clone())?;
        let mut all_data = vec![];

        for _ in 0..100 {
            let data: Vec<f32> = (0..30).map(|_| rng.random_range(-1.0..1.0)).collect();
            let tensor = Tensor::from_slice(&data, shape, &device)?;
            rms.update(&tensor)?;
            all_data.extend(data);
        }

        let all_tensor = Tensor::from_slice(&all_data, (all_data.len() / 3, 3), &device)?;
        let reference_mean = all_tensor.mean(0)?;
        let reference_var = biased_var(&all_tensor, 0)?;

        let mean_diff = (&rms.mean - &reference_mean)?.abs()?.max(0)?;
        let var_diff = (&rms.var - &reference_var)?.abs()?.max(0)?;

        let eps = 1e-4;
        assert!(mean_diff.to_scalar::<f32>()? < eps, "mean mismatch");
        assert!(var_diff.to_scalar::<f32>()? < eps, "variance mismatch");
        Ok(())
    }

    #[test]
    fn normalizes_and_clips() -> Result<()> {
        let device = Device::Cpu;
        let mut rms = RunningMeanStd::new(1, device.clone())?;
        rms.update(&Tensor::from_slice(&[1f32, 3.], (2, 1), &device)?)?;
        let normalized: Vec<Vec<f32>> = rms
            .normalize(&Tensor::from_slice(&[3f32, 1000.], (2, 1), &device)?, 5.)?
            .to_vec2()?;
        assert!((normalized[0][0] - 1.).abs() < 1e-3);
        assert_eq!(normalized[1][0], 5.);
        Ok(())
    }

    #[test]
    fn single_sample_passes_through() -> Result<()> {
        let device = Device::Cpu;
        let mut rms = RunningMeanStd::new(2, device.clone())?;
        let first = Tensor::from_slice(&[0.5f32, -3.], (1, 2), &device)?;
        rms.update(&first)?;
        assert_eq!(rms.normalize(&first, 5.)?.to_vec2::<f32>()?, vec![vec![0.5, -3.]]);

        rms.update(&Tensor::from_slice(&[1.5f32, -1.], (1, 2), &device)?)?;
        let normalized: Vec<Vec<f32>> = rms.normalize(&first, 5.)?.to_vec2()?;
        assert!((normalized[0][0] + 1.).abs() < 1e-3);
        assert!((normalized[0][1] + 1.).abs() < 1e-3);
        Ok(())
    }
}
