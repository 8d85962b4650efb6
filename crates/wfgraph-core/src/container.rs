//! The project's container recipe, rendered as a Dockerfile.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Content hash of a rendered recipe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecipeHash(pub String);

impl RecipeHash {
    /// First 12 hex characters.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl std::fmt::Display for RecipeHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerRecipe {
    pub base_image: String,
    /// `major.minor`, installed from the deadsnakes PPA.
    pub python_version: String,
    /// Native build and video libraries.
    pub system_packages: Vec<String>,
    /// Build-time `ARG`s, passed through from the host.
    pub build_args: Vec<String>,
    pub workdir: String,
    /// Hash-pinned requirements installed before the project.
    pub requirements_file: String,
    /// Extras of the editable project install.
    pub extras: Vec<String>,
    pub entrypoint: Vec<String>,
}

impl Default for ContainerRecipe {
    fn default() -> Self {
        Self {
            base_image: "ubuntu:22.04".to_string(),
            python_version: "3.10".to_string(),
            system_packages: [
                "build-essential",
                "curl",
                "ffmpeg",
                "git",
                "libgl1",
                "libsm6",
                "libxext6",
                "wget",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            build_args: ["http_proxy", "https_proxy", "no_proxy"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            workdir: "/training_extensions".to_string(),
            requirements_file: ".ci/requirements.txt".to_string(),
            extras: vec!["full".to_string()],
            entrypoint: vec!["/bin/bash".to_string()],
        }
    }
}

impl ContainerRecipe {
    fn python(&self) -> String {
        format!("python{}", self.python_version)
    }

    pub fn render(&self) -> String {
        let py = self.python();
        let mut packages: Vec<&str> = self.system_packages.iter().map(String::as_str).collect();
        packages.sort_unstable();
        packages.dedup();

        let mut out = String::new();
        let _ = writeln!(out, "FROM {}", self.base_image);
        out.push('\n');
        for arg in &self.build_args {
            let _ = writeln!(out, "ARG {arg}");
        }
        out.push_str("ENV DEBIAN_FRONTEND=noninteractive\n\n");

        out.push_str("RUN apt-get update && apt-get install -y --no-install-recommends \\\n");
        out.push_str("        software-properties-common \\\n");
        out.push_str("    && add-apt-repository -y ppa:deadsnakes/ppa \\\n");
        out.push_str("    && apt-get update && apt-get install -y --no-install-recommends \\\n");
        let _ = writeln!(out, "        {py} \\");
        let _ = writeln!(out, "        {py}-dev \\");
        let _ = writeln!(out, "        {py}-venv \\");
        for pkg in &packages {
            let _ = writeln!(out, "        {pkg} \\");
        }
        out.push_str("    && rm -rf /var/lib/apt/lists/*\n\n");

        let _ = writeln!(out, "RUN {py} -m ensurepip --upgrade");
        let _ = writeln!(out, "WORKDIR {}", self.workdir);
        let _ = writeln!(out, "COPY . {}", self.workdir);
        out.push('\n');

        let extras = if self.extras.is_empty() {
            String::new()
        } else {
            format!("[{}]", self.extras.join(","))
        };
        let _ = writeln!(
            out,
            "RUN {py} -m pip install --no-cache-dir --require-hashes --no-deps -r {} \\",
            self.requirements_file
        );
        let _ = writeln!(out, "    && {py} -m pip install --no-cache-dir -e \".{extras}\"");
        out.push('\n');

        let entry = self
            .entrypoint
            .iter()
            .map(|e| format!("\"{e}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(out, "ENTRYPOINT [{entry}]");
        out
    }

    /// SHA-256 of the rendered Dockerfile.
    pub fn hash(&self) -> RecipeHash {
        RecipeHash(hex::encode(Sha256::digest(self.render().as_bytes())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_recipe_contract() {
        let dockerfile = ContainerRecipe::default().render();
        assert!(dockerfile.starts_with("FROM ubuntu:22.04\n"));
        assert!(dockerfile.contains("python3.10-dev"));
        assert!(dockerfile.contains("ffmpeg"));
        assert!(dockerfile.contains("--require-hashes --no-deps -r .ci/requirements.txt"));
        assert!(dockerfile.contains("-e \".[full]\""));
        assert!(dockerfile.trim_end().ends_with("ENTRYPOINT [\"/bin/bash\"]"));
    }

    #[test]
    fn test_packages_sorted_and_deduplicated() {
        let recipe = ContainerRecipe {
            system_packages: vec!["git".into(), "curl".into(), "git".into()],
            ..ContainerRecipe::default()
        };
        let dockerfile = recipe.render();
        assert_eq!(dockerfile.matches("        git \\").count(), 1);
        assert!(dockerfile.find("curl").unwrap() < dockerfile.find("        git").unwrap());
    }

    #[test]
    fn test_hash_tracks_content() {
        let a = ContainerRecipe::default();
        let b = ContainerRecipe {
            python_version: "3.11".to_string(),
            ..ContainerRecipe::default()
        };
        assert_eq!(a.hash(), ContainerRecipe::default().hash());
        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.hash().short().len(), 12);
    }
}
