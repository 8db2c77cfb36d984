//! Synthetic deletion of observations.
//!
//! Deleted entries are overwritten with `NaN`, which the model treats as
//! unobserved. Deletion acts on whole time steps of a modality: either all
//! `dim` values of a step are kept or all are removed.

use dks_core::{DksError, ModalitySpec, Sequence};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// How observations are removed from a sequence.
///
/// Serialized externally tagged, so `{"uniform": 0.3}` deletes 30% of
/// steps from every modality.
///
/// # Example
///
/// ```
/// use dks_data::Corruption;
///
/// let c: Corruption = serde_json::from_str(r#"{"uniform": 0.3}"#).unwrap();
/// assert_eq!(c, Corruption::Uniform(0.3));
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Corruption {
    /// Keep everything.
    #[default]
    None,
    /// Delete each (step, modality) independently with probability `p`.
    Uniform(f64),
    /// Delete the whole named modality of a sequence with probability `p`.
    DropModality {
        /// Modality to drop.
        name: String,
        /// Per-sequence drop probability.
        p: f64,
    },
}

impl Corruption {
    /// Checks probabilities are in `[0, 1]` and named modalities exist.
    ///
    /// # Errors
    ///
    /// Returns [`DksError::InvalidConfig`] for a probability outside
    /// `[0, 1]` and [`DksError::UnknownModality`] for an unregistered name.
    pub fn validate(&self, specs: &[ModalitySpec]) -> Result<(), DksError> {
        let p = match self {
            Self::None => return Ok(()),
            Self::Uniform(p) => *p,
            Self::DropModality { name, p } => {
                dks_core::find_modality(specs, name)?;
                *p
            }
        };
        if !(0.0..=1.0).contains(&p) {
            return Err(DksError::InvalidConfig {
                message: format!("corruption probability must be in [0, 1], got {p}"),
            });
        }
        Ok(())
    }

    /// Applies the corruption to one sequence in place.
    ///
    /// Returns the number of deleted (step, modality) pairs. Probabilities
    /// are clamped to `[0, 1]`; a non-finite one deletes nothing.
    pub fn apply<R: Rng + ?Sized>(
        &self,
        seq: &mut Sequence,
        specs: &[ModalitySpec],
        rng: &mut R,
    ) -> usize {
        let len = seq.len();
        match self {
            Self::None => 0,
            Self::Uniform(p) => {
                let mut deleted = 0;
                for spec in specs {
                    let Some(data) = seq.channel_mut(&spec.name) else {
                        continue;
                    };
                    for step in data.chunks_mut(spec.dim) {
                        if rng.gen_bool(usable(*p)) {
                            step.fill(f32::NAN);
                            deleted += 1;
                        }
                    }
                }
                deleted
            }
            Self::DropModality { name, p } => match seq.channel_mut(name) {
                Some(data) if rng.gen_bool(usable(*p)) => {
                    data.fill(f32::NAN);
                    len
                }
                _ => 0,
            },
        }
    }
}

fn usable(p: f64) -> f64 {
    if p.is_finite() {
        p.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn specs() -> Vec<ModalitySpec> {
        vec![ModalitySpec::new("a", 2), ModalitySpec::new("b", 1)]
    }

    fn full_sequence(len: usize) -> Sequence {
        let mut seq = Sequence::new(len);
        for spec in specs() {
            seq.insert(&spec, vec![1.0; len * spec.dim]).unwrap();
        }
        seq
    }

    #[test]
    fn none_keeps_everything() {
        let mut seq = full_sequence(10);
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(Corruption::None.apply(&mut seq, &specs(), &mut rng), 0);
        assert_eq!(seq.observed_fraction(), 1.0);
    }

    #[test]
    fn uniform_extremes() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut seq = full_sequence(8);
        assert_eq!(Corruption::Uniform(0.0).apply(&mut seq, &specs(), &mut rng), 0);

        let mut seq = full_sequence(8);
        assert_eq!(Corruption::Uniform(1.0).apply(&mut seq, &specs(), &mut rng), 16);
        assert_eq!(seq.observed_fraction(), 0.0);
    }

    #[test]
    fn uniform_deletes_whole_steps() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut seq = full_sequence(200);
        Corruption::Uniform(0.5).apply(&mut seq, &specs(), &mut rng);
        for step in seq.channel("a").unwrap().chunks(2) {
            assert_eq!(step[0].is_nan(), step[1].is_nan());
        }
        let frac = seq.observed_fraction();
        assert!(frac > 0.35 && frac < 0.65, "observed fraction {frac}");
    }

    #[test]
    fn drop_modality_targets_one_channel() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut seq = full_sequence(5);
        let c = Corruption::DropModality {
            name: "b".to_string(),
            p: 1.0,
        };
        assert_eq!(c.apply(&mut seq, &specs(), &mut rng), 5);
        assert!(seq.channel("b").unwrap().iter().all(|x| x.is_nan()));
        assert!(seq.channel("a").unwrap().iter().all(|&x| x == 1.0));
    }

    #[test]
    fn unvalidated_probabilities_do_not_panic() {
        let mut rng = StdRng::seed_from_u64(0);
        for p in [f64::NAN, f64::INFINITY, -0.5] {
            let mut seq = full_sequence(6);
            assert_eq!(Corruption::Uniform(p).apply(&mut seq, &specs(), &mut rng), 0);
            let drop = Corruption::DropModality {
                name: "a".to_string(),
                p,
            };
            assert_eq!(drop.apply(&mut seq, &specs(), &mut rng), 0);
            assert_eq!(seq.observed_fraction(), 1.0);
        }
        let mut seq = full_sequence(3);
        assert_eq!(Corruption::Uniform(7.0).apply(&mut seq, &specs(), &mut rng), 6);
        assert!(matches!(
            Corruption::Uniform(f64::NAN).validate(&specs()),
            Err(DksError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn validate_rejects_bad_probability_and_name() {
        assert!(Corruption::Uniform(0.9).validate(&specs()).is_ok());
        assert!(matches!(
            Corruption::Uniform(1.5).validate(&specs()),
            Err(DksError::InvalidConfig { .. })
        ));
        let c = Corruption::DropModality {
            name: "zz".to_string(),
            p: 0.5,
        };
        assert!(matches!(
            c.validate(&specs()),
            Err(DksError::UnknownModality { .. })
        ));
    }
}
