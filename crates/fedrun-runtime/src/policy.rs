//! Sandbox policy: which paths, domains, and tools a unit of work may touch.
//!
//! Deny lists always win. An empty allow list permits anything not denied.

use std::path::{Component, Path, PathBuf};

use crate::error::PolicyViolation;

/// Access policy applied through [`crate::TaskScope`].
#[derive(Debug, Clone)]
pub struct SandboxPolicy {
    pub allowed_paths: Vec<PathBuf>,
    pub denied_paths: Vec<PathBuf>,
    pub allowed_domains: Vec<String>,
    pub denied_domains: Vec<String>,
    pub allowed_tools: Vec<String>,
    pub denied_tools: Vec<String>,
    /// Bytes.
    pub max_file_size: u64,
    /// Bytes.
    pub max_network_payload: u64,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            allowed_paths: ["/tmp", "/var/tmp", "/app/data"].map(PathBuf::from).to_vec(),
            denied_paths: ["/etc", "/var/log", "/root", "/home"]
                .map(PathBuf::from)
                .to_vec(),
            allowed_domains: vec!["github.com".into()],
            denied_domains: ["localhost", "127.0.0.1", "0.0.0.0"]
                .map(String::from)
                .to_vec(),
            allowed_tools: ["github", "rag", "sse", "http"].map(String::from).to_vec(),
            denied_tools: ["shell", "exec", "eval", "require"]
                .map(String::from)
                .to_vec(),
            max_file_size: 10 * 1024 * 1024,
            max_network_payload: 5 * 1024 * 1024,
        }
    }
}

impl SandboxPolicy {
    /// A policy that permits everything up to the size limits.
    pub fn permissive() -> Self {
        Self {
            allowed_paths: Vec::new(),
            denied_paths: Vec::new(),
            allowed_domains: Vec::new(),
            denied_domains: Vec::new(),
            allowed_tools: Vec::new(),
            denied_tools: Vec::new(),
            ..Self::default()
        }
    }

    pub fn check_path(&self, path: &Path) -> Result<(), PolicyViolation> {
        let shown = path.display().to_string();
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(PolicyViolation::PathTraversal(shown));
        }
        if self.denied_paths.iter().any(|denied| path.starts_with(denied)) {
            return Err(PolicyViolation::DeniedPath(shown));
        }
        if !self.allowed_paths.is_empty()
            && !self.allowed_paths.iter().any(|allowed| path.starts_with(allowed))
        {
            return Err(PolicyViolation::PathNotAllowed(shown));
        }
        Ok(())
    }

    pub fn check_domain(&self, domain: &str) -> Result<(), PolicyViolation> {
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();
        if self.denied_domains.iter().any(|d| domain_matches(&domain, d)) {
            return Err(PolicyViolation::DeniedDomain(domain));
        }
        if !self.allowed_domains.is_empty()
            && !self.allowed_domains.iter().any(|d| domain_matches(&domain, d))
        {
            return Err(PolicyViolation::DomainNotAllowed(domain));
        }
        Ok(())
    }

    pub fn check_tool(&self, tool: &str) -> Result<(), PolicyViolation> {
        if self.denied_tools.iter().any(|t| t.eq_ignore_ascii_case(tool)) {
            return Err(PolicyViolation::DeniedTool(tool.to_string()));
        }
        if !self.allowed_tools.is_empty()
            && !self.allowed_tools.iter().any(|t| t.eq_ignore_ascii_case(tool))
        {
            return Err(PolicyViolation::ToolNotAllowed(tool.to_string()));
        }
        Ok(())
    }

    pub fn check_file_size(&self, size: u64) -> Result<(), PolicyViolation> {
        if size > self.max_file_size {
            return Err(PolicyViolation::FileTooLarge {
                size,
                limit: self.max_file_size,
            });
        }
        Ok(())
    }

    pub fn check_network_payload(&self, size: u64) -> Result<(), PolicyViolation> {
        if size > self.max_network_payload {
            return Err(PolicyViolation::PayloadTooLarge {
                size,
                limit: self.max_network_payload,
            });
        }
        Ok(())
    }
}

/// Exact match or subdomain match.
fn domain_matches(domain: &str, rule: &str) -> bool {
    let rule = rule.to_ascii_lowercase();
    domain == rule || domain.ends_with(&format!(".{rule}"))
}
