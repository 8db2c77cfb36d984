//! End-to-end tests: spirals generation, storage, and training on it.

use candle_core::Device;
use candle_nn::VarMap;
use dks_core::{DksError, ModalitySpec};
use dks_data::spirals::{self, generate, SpiralsConfig, SPIRAL_X, SPIRAL_Y};
use dks_data::{Corruption, MultiseqDataset};
use dks_model::config::{DevicePreference, DksConfig};
use dks_model::training::{evaluate, train, TrainConfig};
use dks_model::MultiDks;

fn small_spirals(corruption: Corruption) -> SpiralsConfig {
    SpiralsConfig {
        num_sequences: 10,
        min_len: 8,
        max_len: 16,
        corruption,
        seed: 4,
        ..SpiralsConfig::default()
    }
}

fn small_model(var_map: &VarMap) -> MultiDks {
    let config = DksConfig {
        hidden_dim: 8,
        latent_dim: 4,
        device: DevicePreference::Cpu,
        ..DksConfig::new(spirals::modalities())
    };
    MultiDks::new(var_map, &config).unwrap()
}

#[test]
fn jsonl_roundtrip_preserves_missing_entries() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("spirals.jsonl");
    let mut data = generate(&small_spirals(Corruption::Uniform(0.4))).unwrap();
    data.corrupt(
        &Corruption::DropModality {
            name: SPIRAL_Y.to_string(),
            p: 0.5,
        },
        2,
    )
    .unwrap();

    data.save_jsonl(&path).unwrap();
    let loaded = MultiseqDataset::load_jsonl(&path, spirals::modalities()).unwrap();

    assert_eq!(loaded.len(), data.len());
    for (a, b) in data.sequences().iter().zip(loaded.sequences()) {
        assert_eq!(a.len(), b.len());
        for name in [SPIRAL_X, SPIRAL_Y] {
            let (x, y) = (a.channel(name).unwrap(), b.channel(name).unwrap());
            for (u, v) in x.iter().zip(y) {
                assert!(u == v || (u.is_nan() && v.is_nan()));
            }
        }
    }
}

#[test]
fn jsonl_load_reports_bad_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.jsonl");
    std::fs::write(
        &path,
        "{\"len\":1,\"channels\":{\"spiral-x\":[0.5]}}\n\nnot json\n",
    )
    .unwrap();
    match MultiseqDataset::load_jsonl(&path, spirals::modalities()) {
        Err(DksError::DataError { message }) => assert!(message.contains(":3:"), "{message}"),
        other => panic!("expected DataError, got {other:?}"),
    }

    std::fs::write(&path, "{\"len\":1,\"channels\":{\"audio\":[0.5]}}\n").unwrap();
    assert!(matches!(
        MultiseqDataset::load_jsonl(&path, spirals::modalities()),
        Err(DksError::UnknownModality { .. })
    ));

    assert!(matches!(
        MultiseqDataset::load_jsonl(dir.path().join("missing.jsonl"), spirals::modalities()),
        Err(DksError::Io(_))
    ));
}

#[test]
fn partial_sequence_loads_with_absent_modality() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("partial.jsonl");
    std::fs::write(
        &path,
        "{\"len\":2,\"channels\":{\"spiral-x\":[0.5,null]}}\n",
    )
    .unwrap();
    let data = MultiseqDataset::load_jsonl(&path, spirals::modalities()).unwrap();
    let seq = data.get(0).unwrap();
    assert!(seq.channel(SPIRAL_Y).is_none());
    assert!(seq.channel(SPIRAL_X).unwrap()[1].is_nan());

    let batch = &data.batches(4, None).unwrap()[0];
    assert!(batch.data(SPIRAL_Y).is_none());
}

#[test]
fn trains_on_heavily_corrupted_spirals() {
    let data = generate(&small_spirals(Corruption::Uniform(0.9))).unwrap();
    let (train_set, test_set) = data.split(0.2, 0).unwrap();
    assert_eq!(test_set.len(), 2);

    let var_map = VarMap::new();
    let model = small_model(&var_map);
    let batches = train_set.device_batches(4, Some(1), &Device::Cpu).unwrap();
    let config = TrainConfig {
        epochs: 3,
        log_every: 1,
        ..TrainConfig::default()
    };
    let result = train(&model, &var_map, &batches, &config).unwrap();
    assert!(result.final_loss.is_finite());

    let test_batches = test_set.device_batches(4, None, &Device::Cpu).unwrap();
    let metrics = evaluate(&model, &test_batches).unwrap();
    assert!(metrics.elbo.is_finite());
    assert_eq!(metrics.mse.len(), 2);
}

#[test]
fn single_modality_dataset_reconstructs_the_other() {
    let mut data = generate(&small_spirals(Corruption::None)).unwrap();
    data.corrupt(
        &Corruption::DropModality {
            name: SPIRAL_Y.to_string(),
            p: 1.0,
        },
        0,
    )
    .unwrap();

    let var_map = VarMap::new();
    let model = small_model(&var_map);
    let batch = &data.device_batches(10, None, &Device::Cpu).unwrap()[0];
    let out = model.forward(batch, false).unwrap();
    let y = &out.reconstructions[SPIRAL_Y].mean;
    assert_eq!(y.dims(), &[batch.max_len(), 10, 1]);
    let values = y.flatten_all().unwrap().to_vec1::<f32>().unwrap();
    assert!(values.iter().all(|v| v.is_finite()));
}

#[test]
fn normalization_with_training_statistics() {
    let data = generate(&small_spirals(Corruption::None)).unwrap();
    let (mut train_set, mut test_set) = data.split(0.3, 5).unwrap();
    let stats = train_set.mean_and_std();
    train_set.normalize(&stats).unwrap();
    test_set.normalize(&stats).unwrap();

    let (mean, std) = &train_set.mean_and_std()[SPIRAL_X];
    assert!(mean[0].abs() < 1e-4);
    assert!((std[0] - 1.0).abs() < 1e-3);

    let (max, min) = &test_set.max_and_min()[SPIRAL_Y];
    assert!(max[0] >= min[0]);
    assert_eq!(
        train_set.modalities(),
        &[ModalitySpec::new(SPIRAL_X, 1), ModalitySpec::new(SPIRAL_Y, 1)]
    );
}

#[test]
fn mixed_rate_recordings_batch_together() {
    use std::collections::BTreeMap;

    use dks_data::align::{align, RateChannel};

    let specs = vec![ModalitySpec::new("audio", 2), ModalitySpec::new("video", 1)];
    let mut sequences = Vec::new();
    for video_steps in [3usize, 5] {
        let mut channels = BTreeMap::new();
        channels.insert(
            "audio".to_string(),
            RateChannel::new(50.0, vec![0.25; 2 * 2 * video_steps]),
        );
        channels.insert(
            "video".to_string(),
            RateChannel::new(25.0, (0..video_steps).map(|i| i as f32).collect()),
        );
        sequences.push(align(&specs, channels, None, true).unwrap());
    }
    let data = MultiseqDataset::new(specs, sequences).unwrap();
    let batch = &data.batches(2, None).unwrap()[0];
    assert_eq!(batch.lengths(), &[6, 10]);
    assert_eq!(batch.shape("audio"), Some([10, 2, 2]));
    assert_eq!(batch.shape("video"), Some([10, 2, 1]));
}
