//! End-to-end merge workflows

use super::fixtures::*;
use super::init_test_logging;
use approx::assert_relative_eq;
use candle_core::Device;
use lora_merge::utils::RawTensor;
use lora_merge::{MergeRequest, SubmoduleMerger};
use std::collections::BTreeMap;

fn request(base: &std::path::Path, adapter: &std::path::Path, out: &std::path::Path) -> MergeRequest {
    MergeRequest::new(base.to_string_lossy(), adapter.to_string_lossy()).with_save_path(out)
}

fn assert_values(tensor: &RawTensor, expected: &[f32]) {
    let values = tensor.to_f32_vec("test").unwrap();
    assert_eq!(values.len(), expected.len());
    for (a, b) in values.iter().zip(expected) {
        assert_relative_eq!(*a, *b, epsilon = 1e-5);
    }
}

#[tokio::test]
async fn test_merge_writes_complete_checkpoint() {
    init_test_logging();

    let (_temp_dir, root) = create_test_dir();
    let base = root.join("base");
    let adapter = root.join("adapter");
    let out = root.join("merged");
    create_base_model(&base, BaseModelOptions::default());
    create_adapter(&adapter);

    let summary = SubmoduleMerger::new(Device::Cpu)
        .run(&request(&base, &adapter, &out))
        .await
        .unwrap();

    assert_eq!(summary.submodule, "thinker");
    assert_eq!(summary.merge.merged_layers, 1);
    assert!(summary.extra_file_copied);
    assert_eq!(summary.vocab_size, Some(3));

    for file in [
        "config.json",
        "generation_config.json",
        "model.safetensors",
        "tokenizer.json",
        "tokenizer_config.json",
        "special_tokens_map.json",
        "preprocessor_config.json",
        "chat_template.json",
        "spk_dict.pt",
    ] {
        assert!(out.join(file).exists(), "missing {}", file);
    }
    assert_eq!(std::fs::read(out.join("spk_dict.pt")).unwrap(), SPK_DICT);

    let config: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(out.join("config.json")).unwrap()).unwrap();
    assert_eq!(config["model_type"], "qwen2_5_omni");

    let tokenizer = tokenizers::Tokenizer::from_file(out.join("tokenizer.json")).unwrap();
    assert_eq!(tokenizer.token_to_id("world"), Some(2));
}

#[tokio::test]
async fn test_merged_weights_and_untouched_tensors() {
    init_test_logging();

    let (_temp_dir, root) = create_test_dir();
    let base = root.join("base");
    let adapter = root.join("adapter");
    let out = root.join("merged");
    create_base_model(&base, BaseModelOptions::default());
    create_adapter(&adapter);

    SubmoduleMerger::new(Device::Cpu)
        .run(&request(&base, &adapter, &out))
        .await
        .unwrap();

    let original = base_tensors();
    let merged = load_saved_tensors(&out);
    assert_eq!(
        merged.keys().collect::<Vec<_>>(),
        original.keys().collect::<Vec<_>>()
    );

    // alpha / r = 4 / 2
    let q_name = format!("thinker.{}.weight", Q_PROJ);
    assert_values(&merged[&q_name], &expected_q_proj(2.0));

    for (name, tensor) in &original {
        if *name != q_name {
            assert_eq!(&merged[name], tensor, "{} changed", name);
        }
    }
    // same module path in another submodule
    assert_eq!(merged[&format!("talker.{}.weight", Q_PROJ)].data, original[&format!("talker.{}.weight", Q_PROJ)].data);
}

#[tokio::test]
async fn test_missing_extra_file_is_skipped() {
    init_test_logging();

    let (_temp_dir, root) = create_test_dir();
    let base = root.join("base");
    let adapter = root.join("adapter");
    let out = root.join("merged");
    create_base_model(
        &base,
        BaseModelOptions {
            extra_file: false,
            ..Default::default()
        },
    );
    create_adapter(&adapter);

    let summary = SubmoduleMerger::new(Device::Cpu)
        .run(&request(&base, &adapter, &out))
        .await
        .unwrap();

    assert!(!summary.extra_file_copied);
    assert!(!out.join("spk_dict.pt").exists());
    assert!(out.join("model.safetensors").exists());
}

#[tokio::test]
async fn test_missing_processor_writes_no_processor_files() {
    init_test_logging();

    let (_temp_dir, root) = create_test_dir();
    let base = root.join("base");
    let adapter = root.join("adapter");
    let out = root.join("merged");
    create_base_model(
        &base,
        BaseModelOptions {
            processor: false,
            ..Default::default()
        },
    );
    create_adapter(&adapter);

    let summary = SubmoduleMerger::new(Device::Cpu)
        .run(&request(&base, &adapter, &out))
        .await
        .unwrap();

    assert!(summary.processor_files.is_empty());
    for file in [
        "preprocessor_config.json",
        "processor_config.json",
        "video_preprocessor_config.json",
        "chat_template.json",
    ] {
        assert!(!out.join(file).exists(), "unexpected {}", file);
    }
    assert!(out.join("tokenizer.json").exists());
}

#[tokio::test]
async fn test_custom_extra_file_and_submodule() {
    init_test_logging();

    let (_temp_dir, root) = create_test_dir();
    let base = root.join("base");
    let adapter = root.join("adapter");
    let out = root.join("merged");
    create_base_model(&base, BaseModelOptions::default());
    std::fs::write(base.join("voices.bin"), b"voices").unwrap();
    create_adapter(&adapter);

    let request = request(&base, &adapter, &out)
        .with_submodule_name("talker")
        .with_extra_file("voices.bin");
    let summary = SubmoduleMerger::new(Device::Cpu).run(&request).await.unwrap();

    assert!(summary.extra_file_copied);
    assert_eq!(std::fs::read(out.join("voices.bin")).unwrap(), b"voices");
    assert!(!out.join("spk_dict.pt").exists());

    let merged = load_saved_tensors(&out);
    assert_values(&merged[&format!("talker.{}.weight", Q_PROJ)], &expected_q_proj(2.0));
    assert_values(&merged[&format!("thinker.{}.weight", Q_PROJ)], &BASE_Q);
}

#[tokio::test]
async fn test_sharded_output_round_trips() {
    init_test_logging();

    let (_temp_dir, root) = create_test_dir();
    let base = root.join("base");
    let adapter = root.join("adapter");
    let out = root.join("merged");
    create_base_model(&base, BaseModelOptions::default());
    create_adapter(&adapter);

    let request = request(&base, &adapter, &out).with_max_shard_size("64B").unwrap();
    let summary = SubmoduleMerger::new(Device::Cpu).run(&request).await.unwrap();

    assert!(summary.save.weight_files.len() > 1);
    assert!(out.join("model.safetensors.index.json").exists());
    assert!(!out.join("model.safetensors").exists());

    let merged = load_saved_tensors(&out);
    assert_eq!(merged.len(), base_tensors().len());
    assert_values(&merged[&format!("thinker.{}.weight", Q_PROJ)], &expected_q_proj(2.0));
}

#[tokio::test]
async fn test_modules_to_save_and_embedding_adapter() {
    init_test_logging();

    let (_temp_dir, root) = create_test_dir();
    let base = root.join("base");
    let adapter = root.join("adapter");
    let out = root.join("merged");
    create_base_model(&base, BaseModelOptions::default());

    let mut tensors = BTreeMap::new();
    // embedding: A [r=1, vocab=3], B [dim=4, r=1]
    tensors.insert(
        "base_model.model.model.embed_tokens.lora_embedding_A".to_string(),
        RawTensor::from_f32(vec![1, 3], &[1.0, 0.0, -1.0]).unwrap(),
    );
    tensors.insert(
        "base_model.model.model.embed_tokens.lora_embedding_B".to_string(),
        RawTensor::from_f32(vec![4, 1], &[1.0, 2.0, 3.0, 4.0]).unwrap(),
    );
    tensors.insert(
        "base_model.model.lm_head.modules_to_save.default.weight".to_string(),
        RawTensor::from_f32(vec![3, 3], &[9.0; 9]).unwrap(),
    );
    write_adapter(
        &adapter,
        serde_json::json!({
            "peft_type": "LORA",
            "r": 1,
            "lora_alpha": 1,
            "target_modules": ["embed_tokens"],
            "modules_to_save": ["lm_head"]
        }),
        tensors,
    );

    let summary = SubmoduleMerger::new(Device::Cpu)
        .run(&request(&base, &adapter, &out))
        .await
        .unwrap();
    assert_eq!(summary.merge.merged_layers, 1);
    assert_eq!(summary.merge.replaced_tensors, 1);

    let original = base_tensors();
    let merged = load_saved_tensors(&out);

    assert_values(&merged["thinker.lm_head.weight"], &[9.0; 9]);

    let base_embed = original["thinker.model.embed_tokens.weight"].to_f32_vec("e").unwrap();
    let expected: Vec<f32> = (0..3)
        .flat_map(|row| {
            let a = [1.0f32, 0.0, -1.0][row];
            let base_embed = &base_embed;
            (0..4).map(move |col| base_embed[row * 4 + col] + a * (col as f32 + 1.0))
        })
        .collect();
    assert_values(&merged["thinker.model.embed_tokens.weight"], &expected);
}
