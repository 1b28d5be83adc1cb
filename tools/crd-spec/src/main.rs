use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};

mod crd;

use crd::{process, split_documents};

/// Directories and files controller-gen leaves behind.
const LEFTOVERS: &[&str] = &["config/webhook/manifests.yaml", "config/webhook", "config"];

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn generate_crds() -> Result<String> {
    let output = Command::new("controller-gen")
        .args([
            "paths=./pkg/apis/rollouts/...",
            "crd:trivialVersions=true",
            "output:crd:stdout",
        ])
        .output()
        .context("failed to run controller-gen")?;
    if !output.status.success() {
        return Err(anyhow!(
            "controller-gen failed ({}):\n{}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        ));
    }
    if output.stdout.is_empty() {
        return Err(anyhow!("controller-gen produced no output"));
    }
    String::from_utf8(output.stdout).context("controller-gen output is not UTF-8")
}

fn remove_leftovers(root: &Path) -> Result<()> {
    for leftover in LEFTOVERS {
        let path = root.join(leftover);
        let removed = if path.is_dir() {
            std::fs::remove_dir(&path)
        } else if path.exists() {
            std::fs::remove_file(&path)
        } else {
            continue;
        };
        removed.with_context(|| format!("failed to remove {}", path.display()))?;
    }
    Ok(())
}

fn main() -> Result<()> {
    let repo_root = std::env::current_dir().context("failed to determine current directory")?;

    // A pre-generated YAML file can stand in for controller-gen.
    let raw = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(input) => std::fs::read_to_string(&input)
            .with_context(|| format!("failed to read {}", input.display()))?,
        None => {
            let raw = generate_crds()?;
            remove_leftovers(&repo_root)?;
            raw
        }
    };

    for mut doc in split_documents(&raw)? {
        let kind = process(&mut doc)?;
        let yaml = serde_yaml::to_string(&doc)
            .with_context(|| format!("failed to serialize {kind} CRD"))?;

        let path = repo_root.join(kind.manifest_path());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(&path, yaml.as_bytes())
            .with_context(|| format!("failed to write {}", path.display()))?;

        println!("{} sha256={}", path.display(), sha256_hex(yaml.as_bytes()));
    }

    Ok(())
}
