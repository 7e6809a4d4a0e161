//! Detection of non-finite gradients.

use std::convert::TryFrom;

use shardscale_tch_ext::ParamGroup;
use tch::{Device, Kind, Tensor};

use crate::error::ScalerError;
use crate::replicator::{DeviceReplicator, PerDevice};

/// Unscale gradients in-place and check them for non-finite values.
///
/// The gradients of all parameters in `param_groups` are multiplied by
/// `inv_scale`. For every device that holds a gradient, a copy of the
/// one-element `found_inf` flag is made and set to `1` when a gradient
/// on that device contains an infinite or NaN value. These per-device
/// flags are returned.
///
/// Sparse half-precision gradients are coalesced before the check, since
/// summing values with the same index could overflow.
///
/// If `allow_fp16` is `false`, encountering a half-precision gradient
/// results in an error.
pub fn unscale_grads(
    param_groups: &[ParamGroup],
    inv_scale: &Tensor,
    found_inf: &Tensor,
    allow_fp16: bool,
) -> Result<PerDevice<Tensor>, ScalerError> {
    unscale_named_grads(
        param_groups.iter().flat_map(ParamGroup::params_with_grad),
        inv_scale,
        found_inf,
        allow_fp16,
    )
}

fn unscale_named_grads<'a>(
    grads: impl IntoIterator<Item = (&'a str, Tensor)>,
    inv_scale: &Tensor,
    found_inf: &Tensor,
    allow_fp16: bool,
) -> Result<PerDevice<Tensor>, ScalerError> {
    let mut per_device_inv_scale = DeviceReplicator::new(inv_scale);
    let mut per_device_found_inf = DeviceReplicator::new(found_inf);

    tch::no_grad(|| -> Result<(), ScalerError> {
        // Split the gradients by device and kind, so that each group can
        // be checked with a single kernel call.
        let mut per_device_and_kind: PerDevice<Vec<(Kind, Vec<Tensor>)>> = PerDevice::new();
        for (name, mut grad) in grads {
            if !allow_fp16 && grad.kind() == Kind::Half {
                return Err(ScalerError::HalfPrecisionGradient(name.to_string()));
            }

            let to_unscale = if grad.is_sparse() {
                if grad.kind() == Kind::Half {
                    let coalesced = grad.f_coalesce()?;
                    grad.f_set_data(&coalesced)?;
                }
                grad.f_internal_values()?
            } else {
                grad
            };

            let per_kind = per_device_and_kind.get_mut_or_default(to_unscale.device());
            let kind = to_unscale.kind();
            match per_kind.iter_mut().find(|(k, _)| *k == kind) {
                Some((_, grads)) => grads.push(to_unscale),
                None => per_kind.push((kind, vec![to_unscale])),
            }
        }

        for (device, per_kind) in per_device_and_kind.iter_mut() {
            let device = *device;
            let inv_scale = per_device_inv_scale.get(device)?.shallow_clone();
            let mut found_inf = per_device_found_inf.get(device)?.shallow_clone();

            for (_, grads) in per_kind.iter_mut() {
                if let Device::Cuda(_) = device {
                    Tensor::f_internal_amp_foreach_non_finite_check_and_unscale_(
                        grads.as_slice(),
                        &mut found_inf,
                        &inv_scale,
                    )?;
                } else {
                    non_finite_check_and_unscale_fallback(grads, &mut found_inf, &inv_scale)?;
                }
            }
        }

        Ok(())
    })?;

    Ok(per_device_found_inf.into_per_device())
}

/// Check and unscale gradients on devices without a fused kernel.
///
/// Gradients are checked one by one. As soon as a non-finite gradient
/// is found, `found_inf` is set and the remaining gradients are left
/// untouched, since the optimizer step will be skipped anyway.
pub fn non_finite_check_and_unscale_fallback(
    grads: &mut [Tensor],
    found_inf: &mut Tensor,
    inv_scale: &Tensor,
) -> Result<(), ScalerError> {
    assert_eq!(inv_scale.numel(), 1, "inv_scale must be a 1-element tensor");
    assert_eq!(found_inf.numel(), 1, "found_inf must be a 1-element tensor");

    let inv_scale = f64::try_from(inv_scale)?;

    for grad in grads {
        let all_finite = grad.f_isfinite()?.f_all()?.f_to_kind(Kind::Int64)?;
        if i64::try_from(&all_finite)? == 0 {
            let _ = found_inf.f_fill_(1.0)?;
            break;
        }

        let _ = grad.f_mul_scalar_(inv_scale)?;
    }

    Ok(())
}
