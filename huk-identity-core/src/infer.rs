//! Sine models producing the values that get signed.
//!
//! Both engines approximate `sin(x)` over `[0, 2π]`, the range the models
//! were trained on. Which one runs is picked by the caller at runtime.

use strum::{Display, EnumIter, EnumString};

use crate::cose;
use crate::error::{IdentityError, IdentityResult};
use crate::partition::{EncodeFormat, SecureService};
use crate::registry::{KeyId, KeyRegistry};

/// Upper bound of the model input range.
pub const X_RANGE: f32 = 2.0 * std::f32::consts::PI;

/// Output resolution of the int8-quantized model.
const QUANT_SCALE: f32 = 127.0;

/// Inference engine selected at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum InferenceEngine {
    /// Int8-quantized model; output resolution is 1/127.
    Tflm,
    /// Float model.
    Utvm,
}

impl InferenceEngine {
    /// Runs the model on `x`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if `x` is outside `[0, 2π]`.
    pub fn infer(self, x: f32) -> IdentityResult<f32> {
        if !(0.0..=X_RANGE).contains(&x) {
            return Err(IdentityError::invalid_input(format!(
                "model input {x} outside [0, {X_RANGE}]"
            )));
        }
        let y = match self {
            Self::Tflm => (x.sin() * QUANT_SCALE).round() / QUANT_SCALE,
            Self::Utvm => x.sin(),
        };
        log::debug!("{self} inference: sin({x}) ~ {y}");
        Ok(y)
    }

    /// Runs the model and encodes the result through the partition into
    /// `out`, signed when `format` is [`EncodeFormat::CoseSign1`].
    ///
    /// Returns the model output and the number of bytes written.
    ///
    /// # Errors
    ///
    /// See [`InferenceEngine::infer`] and [`cose::encode`].
    pub fn infer_and_encode<S: SecureService + ?Sized>(
        self,
        service: &S,
        registry: &KeyRegistry,
        x: f32,
        format: EncodeFormat,
        out: &mut [u8],
    ) -> IdentityResult<(f32, usize)> {
        let y = self.infer(x)?;
        let len = cose::encode(service, registry, KeyId::COSE_SIGN, y, format, out)?;
        Ok((y, len))
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use strum::IntoEnumIterator;
    use test_case::test_case;

    use super::*;
    use crate::partition::EmulatedPartition;

    #[test_case("tflm", InferenceEngine::Tflm ; "tflm")]
    #[test_case("utvm", InferenceEngine::Utvm ; "utvm")]
    fn test_parse_engine(text: &str, expected: InferenceEngine) {
        assert_eq!(InferenceEngine::from_str(text).expect("parse"), expected);
        assert_eq!(expected.to_string(), text);
    }

    #[test]
    fn test_models_track_sine() {
        for engine in InferenceEngine::iter() {
            for step in 0..=8u8 {
                let x = (X_RANGE * f32::from(step) / 8.0).min(X_RANGE);
                let y = engine.infer(x).expect("infer");
                assert!((y - x.sin()).abs() < 0.01, "{engine} at {x}: {y}");
            }
        }
    }

    #[test]
    fn test_input_out_of_range() {
        for x in [-0.1, X_RANGE + 0.1, f32::NAN] {
            match InferenceEngine::Utvm.infer(x) {
                Err(IdentityError::InvalidInput(_)) => {}
                Err(err) => panic!("unexpected error: {err}"),
                Ok(_) => panic!("expected error"),
            }
        }
    }

    #[test]
    fn test_infer_and_encode_verifies() {
        let partition = EmulatedPartition::new([4u8; 32]);
        let registry = KeyRegistry::new();
        registry.init(&partition);
        let public_key = partition.export_pubkey(KeyId::COSE_SIGN).expect("export");

        let mut out = [0u8; 256];
        let (y, len) = InferenceEngine::Tflm
            .infer_and_encode(&partition, &registry, 1.0, EncodeFormat::CoseSign1, &mut out)
            .expect("encode");
        let verified = cose::verify(&out[..len], &public_key).expect("verify");
        assert_eq!(verified.to_bits(), y.to_bits());
    }
}
