use super::{Template, TemplateError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Listing entry for an installable template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMeta {
    pub template_id: String,
    pub schema_version: String,
    pub template_version: String,
    pub display_name: String,
    pub language: String,
}

impl From<&Template> for TemplateMeta {
    fn from(t: &Template) -> Self {
        Self {
            template_id: t.template_id.clone(),
            schema_version: t.schema_version.clone(),
            template_version: t.template_version.clone(),
            display_name: t.meta.display_name.clone(),
            language: t.meta.language.clone(),
        }
    }
}

/// Read-only catalogue of `*.json` templates in one directory.
///
/// Loaded templates are cached by `templateId` for the registry's lifetime.
#[derive(Debug)]
pub struct TemplateRegistry {
    root: PathBuf,
    cache: RwLock<HashMap<String, Arc<Template>>>,
}

impl TemplateRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), cache: RwLock::new(HashMap::new()) }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Load and validate every template, sorted by file name. One invalid file fails the listing.
    pub async fn list_templates(&self) -> Result<Vec<TemplateMeta>, TemplateError> {
        let mut metas = Vec::new();
        for path in self.template_files().await? {
            let template = load_file(&path).await?;
            metas.push(TemplateMeta::from(&template));
            self.cache.write().await.insert(template.template_id.clone(), Arc::new(template));
        }
        Ok(metas)
    }

    /// Cached template, or `<template_id>.json` loaded from disk.
    pub async fn get_template(&self, template_id: &str) -> Result<Arc<Template>, TemplateError> {
        if let Some(hit) = self.cache.read().await.get(template_id) {
            return Ok(hit.clone());
        }

        let files = self.template_files().await?;
        let path = files
            .into_iter()
            .find(|p| p.file_stem().and_then(|s| s.to_str()) == Some(template_id))
            .ok_or_else(|| TemplateError::NotFound(template_id.to_string()))?;

        let template = Arc::new(load_file(&path).await?);
        tracing::debug!(
            template_id = %template.template_id,
            version = %template.template_version,
            path = %path.display(),
            "template loaded"
        );
        self.cache.write().await.insert(template.template_id.clone(), template.clone());
        Ok(template)
    }

    async fn template_files(&self) -> Result<Vec<PathBuf>, TemplateError> {
        let io_err = |source: std::io::Error| TemplateError::Io { path: self.root.clone(), source };
        let mut entries = tokio::fs::read_dir(&self.root).await.map_err(io_err)?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

async fn load_file(path: &Path) -> Result<Template, TemplateError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| TemplateError::Io { path: path.to_path_buf(), source })?;
    Template::parse_named(&raw, &path.display().to_string())
}
