use crate::apply::{assets::ProcessorAssets, loader, merger};
use crate::cli::{config::Config, error::CliResult, logging};
use crate::hub;
use crate::lora::{AdapterSummary, LoraAdapter};
use clap::Args;
use colored::*;
use serde::Serialize;
use tracing::info;

#[derive(Args, Debug)]
pub struct InspectCommand {
    /// Base model directory or Hugging Face repo id
    #[arg(value_name = "BASE_MODEL_PATH")]
    pub base_model_path: String,

    /// Adapter to check against the submodule
    #[arg(short = 'a', long = "adapter")]
    pub adapter: Option<String>,

    /// Submodule the adapter is checked against [default: thinker]
    #[arg(long = "submodule-name")]
    pub submodule_name: Option<String>,
}

#[derive(Debug, Serialize)]
struct SubmoduleInfo {
    name: String,
    tensors: usize,
    parameters: usize,
}

#[derive(Debug, Serialize)]
struct AdapterCheck {
    submodule: String,
    summary: AdapterSummary,
    target_modules: String,
    missing_targets: Vec<String>,
}

#[derive(Debug, Serialize)]
struct InspectReport {
    architecture: String,
    tensors: usize,
    total_bytes: u64,
    submodules: Vec<SubmoduleInfo>,
    processor_files: Vec<&'static str>,
    adapter: Option<AdapterCheck>,
}

pub async fn execute(cmd: InspectCommand, config: Config, json: bool) -> CliResult<()> {
    let extra_file = &config.merge.extra_file;
    let base_dir = hub::resolve_model_dir(&cmd.base_model_path, extra_file).await?;
    let mut model = loader::load_base_model(&base_dir).await?;

    let submodules = model
        .submodule_names()
        .into_iter()
        .map(|name| {
            let (tensors, parameters) = model.submodule_stats(&name);
            SubmoduleInfo {
                name,
                tensors,
                parameters,
            }
        })
        .collect();

    let processor_files = ProcessorAssets::load(&base_dir)
        .await
        .map(|p| p.file_names())
        .unwrap_or_default();

    let mut report = InspectReport {
        architecture: model.architecture_name().to_string(),
        tensors: model.tensors.len(),
        total_bytes: model.total_bytes(),
        submodules,
        processor_files,
        adapter: None,
    };

    if let Some(adapter_path) = &cmd.adapter {
        let submodule_name = cmd
            .submodule_name
            .clone()
            .unwrap_or_else(|| config.merge.submodule_name.clone());

        let adapter_dir = hub::resolve_adapter_dir(adapter_path).await?;
        let adapter = LoraAdapter::load(&adapter_dir).await?;
        let submodule = model.take_submodule(&submodule_name)?;
        let missing_targets = merger::missing_targets(&submodule, &adapter);
        info!(
            "Adapter targets {} layers, {} missing from '{}'",
            adapter.layers.len(),
            missing_targets.len(),
            submodule_name
        );

        report.adapter = Some(AdapterCheck {
            submodule: submodule_name,
            summary: adapter.summary(),
            target_modules: adapter.config.target_summary(),
            missing_targets,
        });
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    Ok(())
}

fn print_report(report: &InspectReport) {
    println!("{} {}", "Architecture:".bold(), report.architecture);
    println!(
        "{} {} ({})",
        "Tensors:".bold(),
        report.tensors,
        crate::apply::saver::format_file_size(report.total_bytes)
    );

    println!("\n{}", "Submodules".bold().underline());
    for sub in &report.submodules {
        println!(
            "  {:<24} {:>8} tensors {:>16} parameters",
            sub.name.cyan(),
            sub.tensors,
            sub.parameters
        );
    }

    if report.processor_files.is_empty() {
        println!("\n{} none", "Processor:".bold());
    } else {
        println!("\n{} {}", "Processor:".bold(), report.processor_files.join(", "));
    }

    if let Some(check) = &report.adapter {
        let summary = &check.summary;
        println!("\n{}", "Adapter".bold().underline());
        println!("  target modules   {}", check.target_modules);
        println!(
            "  layers           {} ({} linear, {} embedding, {} DoRA)",
            summary.num_layers, summary.linear_layers, summary.embedding_layers, summary.dora_layers
        );
        println!(
            "  rank / alpha     {} / {}{}",
            summary.rank,
            summary.lora_alpha,
            if summary.use_rslora { " (rsLoRA)" } else { "" }
        );
        println!("  saved tensors    {}", summary.saved_tensors);
        println!("  parameters       {}", summary.total_parameters);

        if check.missing_targets.is_empty() {
            logging::success(&format!(
                "All adapter layers match submodule '{}'",
                check.submodule
            ));
        } else {
            logging::warning(&format!(
                "{} adapter layers have no target in submodule '{}'",
                check.missing_targets.len(),
                check.submodule
            ));
            for name in check.missing_targets.iter().take(10) {
                eprintln!("    {}", name);
            }
        }
    }
}
