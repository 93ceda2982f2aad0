use crate::apply::{MergeRequest, MergeSummary, SubmoduleMerger};
use crate::apply::saver::format_file_size;
use crate::cli::{
    config::{Config, DeviceType},
    error::{CliError, CliResult},
    logging,
    progress::ProgressReporter,
};
use crate::utils::parse_size;
use candle_core::Device;
use clap::Args;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Args, Debug)]
pub struct MergeCommand {
    /// Base model directory or Hugging Face repo id
    #[arg(value_name = "BASE_MODEL_PATH")]
    pub base_model_path: String,

    /// LoRA checkpoint directory or Hugging Face repo id
    #[arg(value_name = "LORA_CHECKPOINT_PATH")]
    pub lora_checkpoint_path: String,

    /// File copied from the base model directory when present [default: spk_dict.pt]
    #[arg(long = "extra-file")]
    pub extra_file: Option<String>,

    /// Submodule the adapter was trained on [default: thinker]
    #[arg(long = "submodule-name")]
    pub submodule_name: Option<String>,

    /// Output directory [default: ./merged_model_checkpoint]
    #[arg(long = "save-path")]
    pub save_path: Option<PathBuf>,

    /// Largest weight file to write, e.g. 5GB or 500MiB [default: 5GB]
    #[arg(long = "max-shard-size")]
    pub max_shard_size: Option<String>,

    /// Device used for merge arithmetic [default: cpu]
    #[arg(short = 'd', long = "device")]
    pub device: Option<DeviceType>,
}

impl MergeCommand {
    /// Build the merge request, filling unset flags from the config file
    pub fn to_request(&self, config: &Config) -> CliResult<MergeRequest> {
        let defaults = &config.merge;

        let max_shard_size = self
            .max_shard_size
            .as_deref()
            .unwrap_or(&defaults.max_shard_size);
        let max_shard_size = parse_size(max_shard_size)
            .map_err(|e| CliError::InvalidArgument(format!("--max-shard-size: {}", e)))?;

        let request = MergeRequest {
            base_model_path: self.base_model_path.clone(),
            lora_checkpoint_path: self.lora_checkpoint_path.clone(),
            extra_file: self
                .extra_file
                .clone()
                .unwrap_or_else(|| defaults.extra_file.clone()),
            submodule_name: self
                .submodule_name
                .clone()
                .unwrap_or_else(|| defaults.submodule_name.clone()),
            save_path: self
                .save_path
                .clone()
                .unwrap_or_else(|| defaults.save_path.clone()),
            max_shard_size,
        };

        request
            .validate()
            .map_err(|e| CliError::InvalidArgument(e.to_string()))?;
        Ok(request)
    }

    /// Device from the flag, else from the config file
    pub fn device_type(&self, config: &Config) -> DeviceType {
        self.device.unwrap_or(config.merge.device)
    }
}

pub async fn execute(cmd: MergeCommand, config: Config, json: bool, quiet: bool) -> CliResult<()> {
    info!("Starting submodule LoRA merge");

    let request = cmd.to_request(&config)?;
    let device = initialize_device(cmd.device_type(&config))?;

    let progress = ProgressReporter::new(
        &format!(
            "Merging LoRA adapter into submodule '{}'...",
            request.submodule_name
        ),
        !json && !quiet,
    );

    let merger = SubmoduleMerger::new(device);
    let summary = match merger.run(&request).await {
        Ok(summary) => summary,
        Err(e) => {
            progress.finish_and_clear();
            return Err(e.into());
        }
    };

    progress.finish("Merge complete");

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else if !quiet {
        report(&request, &summary);
    }

    Ok(())
}

fn report(request: &MergeRequest, summary: &MergeSummary) {
    for name in &summary.merge.skipped_tensors {
        logging::warning(&format!("Adapter tensor '{}' was not applied", name));
    }

    logging::success(&format!(
        "Merged {} LoRA layers into '{}' ({} tensors replaced) in {:.1}s",
        summary.merge.merged_layers,
        summary.submodule,
        summary.merge.replaced_tensors,
        summary.elapsed_ms as f64 / 1000.0
    ));
    logging::info(&format!(
        "Wrote {} in {} weight file(s) to {}",
        format_file_size(summary.save.total_size),
        summary.save.weight_files.len(),
        request.save_path.display()
    ));
    if let Some(vocab_size) = summary.vocab_size {
        logging::info(&format!(
            "Tokenizer files: {} ({} tokens)",
            summary.tokenizer_files.join(", "),
            vocab_size
        ));
    }
    if !summary.processor_files.is_empty() {
        logging::info(&format!("Processor files: {}", summary.processor_files.join(", ")));
    }
    if summary.extra_file_copied {
        logging::info(&format!("Copied {}", request.extra_file));
    }
}

fn initialize_device(device_type: DeviceType) -> CliResult<Device> {
    match device_type {
        DeviceType::Cuda => match Device::new_cuda(0) {
            Ok(device) => {
                info!("Successfully initialized CUDA device");
                Ok(device)
            }
            Err(e) => {
                warn!("CUDA requested but not available: {}", e);
                Err(CliError::CudaNotAvailable)
            }
        },
        DeviceType::Cpu => {
            info!("Using CPU device");
            Ok(Device::Cpu)
        }
        DeviceType::Auto => match Device::new_cuda(0) {
            Ok(device) => {
                info!("Auto-detected CUDA device");
                Ok(device)
            }
            Err(_) => {
                info!("Auto-detected CPU device (CUDA not available)");
                Ok(Device::Cpu)
            }
        },
    }
}
