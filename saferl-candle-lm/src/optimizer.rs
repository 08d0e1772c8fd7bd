use anyhow::Result;
use candle_core::{Tensor, backprop::GradStore};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use std::fmt::Debug;

/// Backpropagates `t` and rescales the gradients of the `varmap` variables so that their
/// global L2 norm does not exceed `max_norm`.
pub fn clip_grad(t: &Tensor, varmap: &VarMap, max_norm: f32) -> Result<GradStore> {
    let mut grad_store = t.backward()?;
    let all_vars = varmap.all_vars();
    let mut total_norm_squared = 0.0f32;
    for var in all_vars.iter() {
        if let Some(grad) = grad_store.get_id(var.id()) {
            total_norm_squared += grad.sqr()?.sum_all()?.to_scalar::<f32>()?;
        }
    }
    let total_norm = total_norm_squared.sqrt();
    if total_norm > max_norm {
        let clip_coef = (max_norm / (total_norm + 1e-6)) as f64;
        for var in all_vars.iter() {
            let clipped = match grad_store.get_id(var.id()) {
                Some(grad) => grad.affine(clip_coef, 0.)?,
                None => continue,
            };
            grad_store.insert(var.as_tensor(), clipped);
        }
    }
    Ok(grad_store)
}

pub struct OptimizerWithMaxGrad {
    pub optimizer: AdamW,
    pub max_grad_norm: Option<f32>,
    pub varmap: VarMap,
}

impl Debug for OptimizerWithMaxGrad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimizerWithMaxGrad")
            .field("optimizer", &self.optimizer)
            .field("max_grad_norm", &self.max_grad_norm)
            .finish()
    }
}

impl OptimizerWithMaxGrad {
    pub fn new(optimizer: AdamW, max_grad_norm: Option<f32>, varmap: VarMap) -> Self {
        Self {
            optimizer,
            max_grad_norm,
            varmap,
        }
    }

    /// Adam without weight decay over every variable of `varmap`.
    pub fn adam(varmap: VarMap, lr: f64, max_grad_norm: Option<f32>) -> Result<Self> {
        let params = ParamsAdamW {
            lr,
            weight_decay: 0.,
            ..Default::default()
        };
        let optimizer = AdamW::new(varmap.all_vars(), params)?;
        Ok(Self::new(optimizer, max_grad_norm, varmap))
    }

    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        let grads = if let Some(max_norm) = self.max_grad_norm {
            clip_grad(loss, &self.varmap, max_norm)?
        } else {
            loss.backward()?
        };
        self.optimizer.step(&grads)?;
        Ok(())
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.optimizer.set_learning_rate(lr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{Init, VarBuilder};

    fn quadratic(varmap: &VarMap) -> Result<Tensor> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        let w = vb.get_with_hints(2, "w", Init::Const(3.))?;
        // d/dw sum(w^2) = 2w = [6, 6], norm 6 * sqrt(2)
        Ok(w.sqr()?.sum_all()?)
    }

    #[test]
    fn clips_global_norm() -> Result<()> {
        let varmap = VarMap::new();
        let loss = quadratic(&varmap)?;
        let grads = clip_grad(&loss, &varmap, 1.)?;
        let var = &varmap.all_vars()[0];
        let grad = grads.get_id(var.id()).expect("gradient of w");
        let norm = grad.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()?;
        assert!((norm - 1.).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn leaves_small_gradients_alone() -> Result<()> {
        let varmap = VarMap::new();
        let loss = quadratic(&varmap)?;
        let grads = clip_grad(&loss, &varmap, 100.)?;
        let var = &varmap.all_vars()[0];
        let grad: Vec<f32> = grads.get_id(var.id()).expect("gradient of w").to_vec1()?;
        assert_eq!(grad, vec![6., 6.]);
        Ok(())
    }

    #[test]
    fn steps_downhill() -> Result<()> {
        let varmap = VarMap::new();
        let loss = quadratic(&varmap)?;
        let mut optimizer = OptimizerWithMaxGrad::adam(varmap.clone(), 0.1, Some(0.5))?;
        optimizer.backward_step(&loss)?;
        let w: Vec<f32> = varmap.all_vars()[0].as_tensor().to_vec1()?;
        assert!(w.iter().all(|w| *w < 3.));
        optimizer.set_learning_rate(0.05);
        assert_eq!(optimizer.learning_rate(), 0.05);
        Ok(())
    }
}
