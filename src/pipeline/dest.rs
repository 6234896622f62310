use camino::Utf8PathBuf;
use futures::{StreamExt, TryStreamExt, stream};

use super::{BuildFile, Packet, Step, from_fn};
use crate::error::PipelineError;
use crate::utils::normalize_path;

/// Terminal step writing every file into each of `dirs`.
///
/// Nothing is written until the upstream stream has finished without an
/// error, so a failed run leaves the previous output untouched.
pub fn dest(dirs: Vec<Utf8PathBuf>) -> impl Step {
    from_fn("dest", move |input| {
        stream::once(async move {
            let packets: Vec<Packet> = input.try_collect().await?;

            for packet in &packets {
                if let Packet::File(file) = packet {
                    for dir in &dirs {
                        write_file(dir, file).await?;
                    }
                }
            }

            Ok::<_, PipelineError>(packets)
        })
        .map_ok(|packets| stream::iter(packets.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
    })
}

async fn write_file(dir: &Utf8PathBuf, file: &BuildFile) -> Result<(), PipelineError> {
    let path = normalize_path(&dir.join(&file.path));

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| PipelineError::Write(parent.to_owned(), err))?;
    }

    tokio::fs::write(&path, &file.contents)
        .await
        .map_err(|err| PipelineError::Write(path.clone(), err))?;

    tracing::debug!("Wrote '{path}'");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf8(dir: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
    }

    #[tokio::test]
    async fn test_writes_every_platform() {
        let tmp = tempfile::tempdir().unwrap();
        let root = utf8(&tmp);
        let dirs = vec![root.join("chrome"), root.join("firefox")];

        let input = stream::iter(vec![
            Ok(Packet::File(BuildFile::new("ui-0.js", "ui();"))),
            Ok(Packet::File(BuildFile::new("../sourcemaps/ui-0.js.map", "{}"))),
        ])
        .boxed();

        let out: Vec<_> = Box::new(dest(dirs)).apply(input).try_collect().await.unwrap();
        assert_eq!(out.len(), 2);

        for platform in ["chrome", "firefox"] {
            let js = std::fs::read_to_string(root.join(platform).join("ui-0.js")).unwrap();
            assert_eq!(js, "ui();");
        }
        assert!(root.join("sourcemaps/ui-0.js.map").exists());
    }

    #[tokio::test]
    async fn test_nothing_written_after_upstream_error() {
        let tmp = tempfile::tempdir().unwrap();
        let root = utf8(&tmp);

        let input = stream::iter(vec![
            Ok(Packet::File(BuildFile::new("first.js", "ok();"))),
            Err(PipelineError::UnknownStage("broken".into())),
            Ok(Packet::File(BuildFile::new("second.js", "ok();"))),
        ])
        .boxed();

        let result: Result<Vec<_>, _> = Box::new(dest(vec![root.join("chrome")]))
            .apply(input)
            .try_collect()
            .await;

        assert!(result.is_err());
        assert!(!root.join("chrome/first.js").exists());
    }
}
