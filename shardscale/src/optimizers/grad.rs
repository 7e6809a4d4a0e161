use shardscale_tch_ext::ParamGroup;

pub trait ZeroGrad {
    /// Zero out gradients.
    fn zero_grad(&self);
}

impl ZeroGrad for [ParamGroup] {
    fn zero_grad(&self) {
        for group in self {
            for (_, param) in &group.params {
                if param.requires_grad() {
                    param.shallow_clone().zero_grad()
                }
            }
        }
    }
}
