use crate::LoraError;

pub const DEFAULT_LORA_SCALE: f64 = 0.8;

/// Pairs every requested LoRA with a scale.
///
/// No scales means [`DEFAULT_LORA_SCALE`] for each, a single scale applies to
/// all of them, and extra scales beyond the number of LoRAs are ignored.
pub fn resolve_scales(loras: usize, scales: &[f64]) -> Result<Vec<f64>, LoraError> {
    match scales.len() {
        0 => Ok(vec![DEFAULT_LORA_SCALE; loras]),
        1 => Ok(vec![scales[0]; loras]),
        n if n >= loras => Ok(scales[..loras].to_vec()),
        n => Err(LoraError::ScaleCountMismatch { loras, scales: n }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_missing() {
        assert_eq!(resolve_scales(3, &[]).unwrap(), vec![0.8, 0.8, 0.8]);
    }

    #[test]
    fn single_scale_broadcasts() {
        assert_eq!(resolve_scales(2, &[1.2]).unwrap(), vec![1.2, 1.2]);
    }

    #[test]
    fn extra_scales_are_dropped() {
        assert_eq!(resolve_scales(2, &[0.5, 0.6, 0.7]).unwrap(), vec![0.5, 0.6]);
    }

    #[test]
    fn too_few_scales() {
        assert!(matches!(
            resolve_scales(3, &[0.5, 0.6]),
            Err(LoraError::ScaleCountMismatch {
                loras: 3,
                scales: 2
            })
        ));
    }
}
