use std::sync::Arc;

use super::sourcemap::{SourceMap, extract_inline};
use super::{BuildFile, Step, map_files};
use crate::error::PipelineError;

/// Output of a [`Minifier`].
#[derive(Debug, Clone, PartialEq)]
pub struct Minified {
    pub code: String,
    /// Map from the minified code back to the original sources. When the
    /// minifier can't produce one the file leaves the step without a map.
    pub map: Option<SourceMap>,
}

/// Something able to shrink one JavaScript file.
pub trait Minifier: Send + Sync {
    fn minify(&self, file: &BuildFile) -> anyhow::Result<Minified>;
}

/// Minifies by piping files through `esbuild --minify`, letting esbuild chain
/// the incoming inline source map into the one it produces.
#[derive(Debug, Clone)]
pub struct EsbuildMinifier {
    binary: String,
}

impl Default for EsbuildMinifier {
    fn default() -> Self {
        Self {
            binary: "esbuild".into(),
        }
    }
}

impl EsbuildMinifier {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Minifier for EsbuildMinifier {
    fn minify(&self, file: &BuildFile) -> anyhow::Result<Minified> {
        let mut input = file.contents.clone();
        if let Some(map) = &file.map {
            input = format!(
                "{}\n//# sourceMappingURL={}\n",
                input.trim_end(),
                map.to_data_url()?
            );
        }

        let sourcefile = format!("--sourcefile={}", file.path);
        let output = crate::esbuild::transform_stdin(
            &self.binary,
            &["--minify", "--loader=js", "--sourcemap=inline", &sourcefile],
            &input,
        )?;

        let (code, map) = extract_inline(&file.path, &output)?;
        Ok(Minified { code, map })
    }
}

/// Replace the contents of every file with the minified code. A minifier
/// failure fails the run.
pub fn minify(minifier: Arc<dyn Minifier>) -> impl Step {
    map_files("minify", move |file| {
        let minifier = minifier.clone();

        async move {
            tokio::task::spawn_blocking(move || {
                let Minified { code, map } =
                    minifier
                        .minify(&file)
                        .map_err(|source| PipelineError::Minify {
                            file: file.path.clone(),
                            source,
                        })?;

                tracing::debug!(
                    "Minified '{}' {} -> {} bytes",
                    file.path,
                    file.contents.len(),
                    code.len()
                );

                Ok::<_, PipelineError>(BuildFile {
                    contents: code,
                    map,
                    ..file
                })
            })
            .await?
        }
    })
}
