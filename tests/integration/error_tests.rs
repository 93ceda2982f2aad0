//! Error handling and edge case tests

use super::fixtures::*;
use super::init_test_logging;
use candle_core::Device;
use lora_merge::utils::RawTensor;
use lora_merge::{MergeError, MergeRequest, SubmoduleMerger};
use std::collections::BTreeMap;
use std::path::Path;

async fn run(base: &Path, adapter: &Path, out: &Path, submodule: &str) -> Result<(), MergeError> {
    let request = MergeRequest::new(base.to_string_lossy(), adapter.to_string_lossy())
        .with_save_path(out)
        .with_submodule_name(submodule);
    SubmoduleMerger::new(Device::Cpu).run(&request).await.map(|_| ())
}

#[tokio::test]
async fn test_unknown_submodule_is_named_error() {
    init_test_logging();

    let (_temp_dir, root) = create_test_dir();
    let (base, adapter, out) = (root.join("base"), root.join("adapter"), root.join("out"));
    create_base_model(&base, BaseModelOptions::default());
    create_adapter(&adapter);

    let err = run(&base, &adapter, &out, "vision").await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "The model does not have a submodule named 'vision'."
    );
    match err {
        MergeError::SubmoduleNotFound { name, available } => {
            assert_eq!(name, "vision");
            assert_eq!(available, vec!["talker", "thinker", "token2wav"]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!out.exists(), "nothing should be written");
}

#[tokio::test]
async fn test_submodule_prefix_must_end_on_a_dot() {
    init_test_logging();

    let (_temp_dir, root) = create_test_dir();
    let (base, adapter, out) = (root.join("base"), root.join("adapter"), root.join("out"));
    create_base_model(&base, BaseModelOptions::default());
    create_adapter(&adapter);

    let err = run(&base, &adapter, &out, "think").await.unwrap_err();
    assert!(matches!(err, MergeError::SubmoduleNotFound { .. }));
}

#[tokio::test]
async fn test_missing_tokenizer_fails() {
    init_test_logging();

    let (_temp_dir, root) = create_test_dir();
    let (base, adapter, out) = (root.join("base"), root.join("adapter"), root.join("out"));
    create_base_model(
        &base,
        BaseModelOptions {
            tokenizer: false,
            ..Default::default()
        },
    );
    create_adapter(&adapter);

    let err = run(&base, &adapter, &out, "thinker").await.unwrap_err();
    assert!(matches!(err, MergeError::Tokenizer(_)));
}

#[tokio::test]
async fn test_missing_model_config() {
    init_test_logging();

    let (_temp_dir, root) = create_test_dir();
    let (base, adapter, out) = (root.join("base"), root.join("adapter"), root.join("out"));
    create_base_model(&base, BaseModelOptions::default());
    std::fs::remove_file(base.join("config.json")).unwrap();
    create_adapter(&adapter);

    let err = run(&base, &adapter, &out, "thinker").await.unwrap_err();
    assert!(matches!(err, MergeError::ModelLoading(_)));
    assert!(err.to_string().contains("config.json"));
}

#[tokio::test]
async fn test_adapter_for_wrong_shape() {
    init_test_logging();

    let (_temp_dir, root) = create_test_dir();
    let (base, adapter, out) = (root.join("base"), root.join("adapter"), root.join("out"));
    create_base_model(&base, BaseModelOptions::default());

    let mut tensors = BTreeMap::new();
    tensors.insert(
        format!("base_model.model.{}.lora_A.weight", Q_PROJ),
        RawTensor::from_f32(vec![2, 3], &LORA_A).unwrap(),
    );
    tensors.insert(
        format!("base_model.model.{}.lora_B.weight", Q_PROJ),
        RawTensor::from_f32(vec![5, 2], &[0.0; 10]).unwrap(),
    );
    write_adapter(&adapter, adapter_config(), tensors);

    let err = run(&base, &adapter, &out, "thinker").await.unwrap_err();
    assert!(matches!(err, MergeError::ShapeMismatch { .. }));
}

#[tokio::test]
async fn test_adapter_for_other_architecture() {
    init_test_logging();

    let (_temp_dir, root) = create_test_dir();
    let (base, adapter, out) = (root.join("base"), root.join("adapter"), root.join("out"));
    create_base_model(&base, BaseModelOptions::default());

    let mut tensors = BTreeMap::new();
    tensors.insert(
        "base_model.model.transformer.h.0.attn.c_attn.lora_A.weight".to_string(),
        RawTensor::from_f32(vec![2, 3], &LORA_A).unwrap(),
    );
    tensors.insert(
        "base_model.model.transformer.h.0.attn.c_attn.lora_B.weight".to_string(),
        RawTensor::from_f32(vec![4, 2], &LORA_B).unwrap(),
    );
    write_adapter(&adapter, adapter_config(), tensors);

    let err = run(&base, &adapter, &out, "thinker").await.unwrap_err();
    assert!(matches!(err, MergeError::IncompatibleAdapter(_)));
    assert!(!out.exists());
}

#[tokio::test]
async fn test_pickled_adapter_is_rejected() {
    init_test_logging();

    let (_temp_dir, root) = create_test_dir();
    let (base, adapter, out) = (root.join("base"), root.join("adapter"), root.join("out"));
    create_base_model(&base, BaseModelOptions::default());
    std::fs::create_dir_all(&adapter).unwrap();
    std::fs::write(
        adapter.join("adapter_config.json"),
        serde_json::to_string(&adapter_config()).unwrap(),
    )
    .unwrap();
    std::fs::write(adapter.join("adapter_model.bin"), b"\x80\x02pickle").unwrap();

    let err = run(&base, &adapter, &out, "thinker").await.unwrap_err();
    assert!(matches!(err, MergeError::UnsupportedFormat(_)));
}

#[tokio::test]
async fn test_missing_adapter_config() {
    init_test_logging();

    let (_temp_dir, root) = create_test_dir();
    let (base, adapter, out) = (root.join("base"), root.join("adapter"), root.join("out"));
    create_base_model(&base, BaseModelOptions::default());
    create_adapter(&adapter);
    std::fs::remove_file(adapter.join("adapter_config.json")).unwrap();

    let err = run(&base, &adapter, &out, "thinker").await.unwrap_err();
    assert!(matches!(err, MergeError::AdapterLoading(_)));
}

#[tokio::test]
async fn test_rank_mismatch_with_config() {
    init_test_logging();

    let (_temp_dir, root) = create_test_dir();
    let (base, adapter, out) = (root.join("base"), root.join("adapter"), root.join("out"));
    create_base_model(&base, BaseModelOptions::default());

    let mut config = adapter_config();
    config["r"] = serde_json::json!(8);
    let mut tensors = BTreeMap::new();
    tensors.insert(
        format!("base_model.model.{}.lora_A.weight", Q_PROJ),
        RawTensor::from_f32(vec![2, 3], &LORA_A).unwrap(),
    );
    tensors.insert(
        format!("base_model.model.{}.lora_B.weight", Q_PROJ),
        RawTensor::from_f32(vec![4, 2], &LORA_B).unwrap(),
    );
    write_adapter(&adapter, config, tensors);

    let err = run(&base, &adapter, &out, "thinker").await.unwrap_err();
    assert!(matches!(err, MergeError::AdapterLoading(_)));
}
