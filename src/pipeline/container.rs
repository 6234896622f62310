use futures::{StreamExt, TryStreamExt};

use super::sourcemap::{SourceMap, encode_line_mappings};
use super::{BuildFile, Packet, Step, from_fn};
use crate::error::PipelineError;
use crate::factor::ModuleGroup;

/// Global array every chunk registers its modules into. Loading the chunks of
/// one group in any order yields the same registry.
pub const REGISTRY_GLOBAL: &str = "globalThis.tsumugiModules";

/// Pack every module group into one `<label>.js` file with a line-level
/// source map.
pub fn container() -> impl Step {
    from_fn("container", |input| {
        input
            .and_then(|packet| async move {
                match packet {
                    Packet::Group(group) => pack(&group).map(Packet::File),
                    other => Ok(other),
                }
            })
            .boxed()
    })
}

fn pack(group: &ModuleGroup) -> Result<BuildFile, PipelineError> {
    let mut out = String::new();
    let mut lines: Vec<Option<(u32, u32)>> = Vec::new();
    let mut map = SourceMap::default();

    let mut emit = |out: &mut String, text: &str, origin: Option<(u32, u32)>| {
        out.push_str(text);
        out.push('\n');
        lines.push(origin);
    };

    emit(
        &mut out,
        &format!("({REGISTRY_GLOBAL} = {REGISTRY_GLOBAL} || []).push([{{"),
        None,
    );

    for (index, module) in group.modules.iter().enumerate() {
        let source = index as u32;
        map.sources.push(module.file.to_string());
        map.sources_content.push(Some(module.source.clone()));

        let id = serde_json::to_string(&module.id)?;
        emit(&mut out, &format!("{id}: [function (require, module, exports) {{"), None);

        for (line, text) in module.source.lines().enumerate() {
            emit(&mut out, text, Some((source, line as u32)));
        }

        let deps = serde_json::to_string(&module.deps)?;
        emit(&mut out, &format!("}}, {deps}],"), None);
    }

    let entries: Vec<&str> = group
        .modules
        .iter()
        .filter(|module| module.entry)
        .map(|module| module.id.as_str())
        .collect();

    out.push_str(&format!("}}, {}]);\n", serde_json::to_string(&entries)?));
    lines.push(None);

    map.mappings = encode_line_mappings(&lines);

    Ok(BuildFile {
        path: format!("{}.js", group.label).into(),
        contents: out,
        map: Some(map),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::ModuleRecord;
    use futures::stream;

    fn group() -> ModuleGroup {
        ModuleGroup {
            label: "ui-0".into(),
            parent: "ui".into(),
            modules: vec![
                ModuleRecord::new("1", "src/ui/index.js", "const x = require('./x');\nx();")
                    .with_dep("./x", Some("2"))
                    .as_entry(),
                ModuleRecord::new("2", "src/ui/x.js", "module.exports = () => {};")
                    .with_dep("fs", None),
            ],
        }
    }

    #[test]
    fn test_registration_format() {
        let file = pack(&group()).unwrap();

        assert_eq!(file.path, "ui-0.js");
        assert!(file.contents.starts_with("(globalThis.tsumugiModules = globalThis.tsumugiModules || []).push([{"));
        assert!(file.contents.contains("\"1\": [function (require, module, exports) {\nconst x = require('./x');\nx();\n}, {\"./x\":\"2\"}],"));
        assert!(file.contents.contains("}, {\"fs\":null}],"));
        assert!(file.contents.ends_with("}, [\"1\"]]);\n"));
    }

    #[test]
    fn test_lines_map_back_to_sources() {
        let file = pack(&group()).unwrap();
        let map = file.map.unwrap();
        let decoded = map.decode_mappings().unwrap();
        let generated: Vec<&str> = file.contents.lines().collect();

        assert_eq!(map.sources, vec!["src/ui/index.js", "src/ui/x.js"]);

        for (index, segments) in decoded.iter().enumerate() {
            let Some(segment) = segments.first() else {
                continue;
            };
            let source = map.sources_content[segment[1] as usize].as_deref().unwrap();
            let original = source.lines().nth(segment[2] as usize).unwrap();
            assert_eq!(generated[index], original);
        }

        let mapped = decoded.iter().filter(|s| !s.is_empty()).count();
        assert_eq!(mapped, 3);
    }

    #[tokio::test]
    async fn test_empty_group_still_packs() {
        let empty = ModuleGroup {
            label: "popup-0".into(),
            parent: "popup".into(),
            modules: vec![],
        };

        let input = stream::iter(vec![Ok(Packet::Group(empty))]).boxed();
        let out: Vec<_> = Box::new(container()).apply(input).try_collect().await.unwrap();

        let [Packet::File(file)] = out.as_slice() else {
            panic!("expected one file");
        };
        assert_eq!(file.path, "popup-0.js");
        assert!(file.contents.ends_with("}, []]);\n"));
    }
}
