//! Aligning modalities recorded at different rates onto one time grid.
//!
//! Each channel is resampled to `base_rate` by taking, for base step `t`,
//! the source step that covers the instant `t / base_rate` (sample and
//! hold). With `truncate` the sequence ends with the shortest channel;
//! otherwise it runs to the longest and the tails of shorter channels are
//! `NaN`.

use std::collections::BTreeMap;

use dks_core::{find_modality, DksError, ModalitySpec, Sequence};

/// Raw samples of one modality at its native rate.
#[derive(Debug, Clone, PartialEq)]
pub struct RateChannel {
    /// Steps per second.
    pub rate: f64,
    /// Row-major `steps × dim` values.
    pub data: Vec<f32>,
}

impl RateChannel {
    /// Creates a channel from its rate and row-major data.
    pub fn new(rate: f64, data: Vec<f32>) -> Self {
        Self { rate, data }
    }
}

/// Resamples `channels` onto a common grid and packs them into a
/// [`Sequence`].
///
/// `base_rate` defaults to the fastest channel's rate.
///
/// # Errors
///
/// Returns [`DksError::DataError`] if `channels` is empty,
/// [`DksError::UnknownModality`] for an unregistered name,
/// [`DksError::InvalidConfig`] for a non-positive rate and
/// [`DksError::ShapeMismatch`] for data that is not a whole, non-zero
/// number of `dim`-sized steps.
///
/// # Example
///
/// ```
/// use std::collections::BTreeMap;
/// use dks_core::ModalitySpec;
/// use dks_data::align::{align, RateChannel};
///
/// let specs = vec![ModalitySpec::new("audio", 1), ModalitySpec::new("video", 1)];
/// let mut channels = BTreeMap::new();
/// channels.insert("audio".to_string(), RateChannel::new(50.0, vec![0.0, 1.0, 2.0, 3.0]));
/// channels.insert("video".to_string(), RateChannel::new(25.0, vec![10.0, 20.0]));
///
/// let seq = align(&specs, channels, None, true).unwrap();
/// assert_eq!(seq.len(), 4);
/// assert_eq!(seq.channel("video"), Some(&[10.0, 10.0, 20.0, 20.0][..]));
/// ```
pub fn align(
    specs: &[ModalitySpec],
    channels: BTreeMap<String, RateChannel>,
    base_rate: Option<f64>,
    truncate: bool,
) -> Result<Sequence, DksError> {
    let mut checked = Vec::with_capacity(channels.len());
    for (name, channel) in channels {
        let spec = find_modality(specs, &name)?;
        check_rate(&name, channel.rate)?;
        let steps = channel.data.len() / spec.dim;
        if steps == 0 || channel.data.len() % spec.dim != 0 {
            return Err(DksError::ShapeMismatch {
                modality: name,
                expected: vec![spec.dim],
                actual: vec![channel.data.len()],
            });
        }
        checked.push((spec, channel, steps));
    }

    let fastest = checked
        .iter()
        .map(|(_, c, _)| c.rate)
        .fold(None, |acc: Option<f64>, r| Some(acc.map_or(r, |a| a.max(r))));
    let Some(fastest) = fastest else {
        return Err(DksError::DataError {
            message: "align: no channels given".to_string(),
        });
    };
    let base = base_rate.unwrap_or(fastest);
    check_rate("base_rate", base)?;

    // Length of each channel on the base grid.
    let base_lens: Vec<usize> = checked
        .iter()
        .map(|(_, c, steps)| ((*steps as f64 * base / c.rate) - 1e-9).ceil().max(1.0) as usize)
        .collect();
    let len = if truncate {
        base_lens.iter().copied().min()
    } else {
        base_lens.iter().copied().max()
    }
    .unwrap_or(0);

    let mut seq = Sequence::new(len);
    for ((spec, channel, steps), base_len) in checked.into_iter().zip(base_lens) {
        let dim = spec.dim;
        let mut out = Vec::with_capacity(len * dim);
        for t in 0..len {
            if t >= base_len {
                out.extend(std::iter::repeat(f32::NAN).take(dim));
                continue;
            }
            let src = ((t as f64 * channel.rate / base + 1e-9).floor() as usize).min(steps - 1);
            out.extend_from_slice(&channel.data[src * dim..(src + 1) * dim]);
        }
        seq.insert(spec, out)?;
    }
    Ok(seq)
}

fn check_rate(name: &str, rate: f64) -> Result<(), DksError> {
    if rate.is_finite() && rate > 0.0 {
        Ok(())
    } else {
        Err(DksError::InvalidConfig {
            message: format!("{name}: rate must be positive, got {rate}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs() -> Vec<ModalitySpec> {
        vec![ModalitySpec::new("audio", 2), ModalitySpec::new("video", 1)]
    }

    fn channels(audio: RateChannel, video: RateChannel) -> BTreeMap<String, RateChannel> {
        let mut map = BTreeMap::new();
        map.insert("audio".to_string(), audio);
        map.insert("video".to_string(), video);
        map
    }

    #[test]
    fn downsamples_to_slower_base() {
        // 100 Hz audio, 25 Hz video, base 25 Hz: keep every 4th audio step.
        let audio: Vec<f32> = (0..16).flat_map(|i| [i as f32, -(i as f32)]).collect();
        let seq = align(
            &specs(),
            channels(
                RateChannel::new(100.0, audio),
                RateChannel::new(25.0, vec![1.0, 2.0, 3.0, 4.0]),
            ),
            Some(25.0),
            true,
        )
        .unwrap();
        assert_eq!(seq.len(), 4);
        assert_eq!(
            seq.channel("audio"),
            Some(&[0.0, 0.0, 4.0, -4.0, 8.0, -8.0, 12.0, -12.0][..])
        );
        assert_eq!(seq.channel("video"), Some(&[1.0, 2.0, 3.0, 4.0][..]));
    }

    #[test]
    fn truncate_versus_pad() {
        let make = || {
            channels(
                RateChannel::new(10.0, vec![0.0; 2 * 6]),
                RateChannel::new(10.0, vec![1.0, 2.0, 3.0]),
            )
        };
        let short = align(&specs(), make(), None, true).unwrap();
        assert_eq!(short.len(), 3);

        let long = align(&specs(), make(), None, false).unwrap();
        assert_eq!(long.len(), 6);
        let video = long.channel("video").unwrap();
        assert_eq!(&video[..3], &[1.0, 2.0, 3.0]);
        assert!(video[3..].iter().all(|x| x.is_nan()));
    }

    #[test]
    fn single_channel_missing_modality_stays_absent() {
        let mut map = BTreeMap::new();
        map.insert("video".to_string(), RateChannel::new(25.0, vec![1.0, 2.0]));
        let seq = align(&specs(), map, None, true).unwrap();
        assert_eq!(seq.len(), 2);
        assert!(seq.channel("audio").is_none());
        assert!(seq.validate(&specs()).is_ok());
    }

    #[test]
    fn bad_inputs_rejected() {
        assert!(matches!(
            align(&specs(), BTreeMap::new(), None, true),
            Err(DksError::DataError { .. })
        ));
        let ragged = channels(
            RateChannel::new(10.0, vec![0.0; 3]),
            RateChannel::new(10.0, vec![1.0]),
        );
        assert!(matches!(
            align(&specs(), ragged, None, true),
            Err(DksError::ShapeMismatch { .. })
        ));
        let zero_rate = channels(
            RateChannel::new(0.0, vec![0.0; 2]),
            RateChannel::new(10.0, vec![1.0]),
        );
        assert!(matches!(
            align(&specs(), zero_rate, None, true),
            Err(DksError::InvalidConfig { .. })
        ));
        let mut unknown = BTreeMap::new();
        unknown.insert("text".to_string(), RateChannel::new(1.0, vec![0.0]));
        assert!(matches!(
            align(&specs(), unknown, None, true),
            Err(DksError::UnknownModality { .. })
        ));
        let base = channels(
            RateChannel::new(10.0, vec![0.0; 2]),
            RateChannel::new(10.0, vec![1.0]),
        );
        assert!(matches!(
            align(&specs(), base, Some(-1.0), true),
            Err(DksError::InvalidConfig { .. })
        ));
    }
}
