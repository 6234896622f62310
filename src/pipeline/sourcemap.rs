//! Version 3 source maps, the steps which load them from the bundler output
//! and the steps which write them back out.
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use camino::{Utf8Path, Utf8PathBuf};
use futures::{StreamExt, TryStreamExt, future, stream};
use serde::{Deserialize, Serialize};

use super::{BuildFile, Packet, Step, from_fn, map_files};
use crate::error::PipelineError;

const BASE64_DIGITS: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

const URL_PREFIX: &str = "//# sourceMappingURL=";
const DATA_PREFIX: &str = "data:application/json;charset=utf-8;base64,";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMap {
    pub version: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources_content: Vec<Option<String>>,
    #[serde(default)]
    pub names: Vec<String>,
    pub mappings: String,
}

impl Default for SourceMap {
    fn default() -> Self {
        Self {
            version: 3,
            file: None,
            sources: Vec::new(),
            sources_content: Vec::new(),
            names: Vec::new(),
            mappings: String::new(),
        }
    }
}

impl SourceMap {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// `data:` URL carrying the whole map.
    pub fn to_data_url(&self) -> Result<String, serde_json::Error> {
        Ok(format!("{DATA_PREFIX}{}", STANDARD.encode(self.to_json()?)))
    }

    /// Decoded segments per generated line. Every segment is absolute:
    /// `[column, source, line, column]`, optionally followed by a name index.
    #[cfg(test)]
    pub(crate) fn decode_mappings(&self) -> Option<Vec<Vec<Vec<i64>>>> {
        let mut state = [0i64; 5];
        let mut lines = Vec::new();

        for line in self.mappings.split(';') {
            state[0] = 0;
            let mut segments = Vec::new();

            for segment in line.split(',').filter(|s| !s.is_empty()) {
                let fields = vlq_decode(segment)?;
                let mut absolute = Vec::with_capacity(fields.len());
                for (i, delta) in fields.into_iter().enumerate() {
                    *state.get_mut(i)? += delta;
                    absolute.push(state[i]);
                }
                segments.push(absolute);
            }

            lines.push(segments);
        }

        Some(lines)
    }
}

/// Append the base64 VLQ encoding of `value` to `out`.
pub fn vlq_encode(value: i64, out: &mut String) {
    let mut vlq = if value < 0 {
        ((-value) << 1) | 1
    } else {
        value << 1
    };

    loop {
        let mut digit = vlq & 0b11111;
        vlq >>= 5;
        if vlq > 0 {
            digit |= 0b100000;
        }
        out.push(BASE64_DIGITS[digit as usize] as char);
        if vlq == 0 {
            break;
        }
    }
}

/// Decode every value of one VLQ segment. Values wider than 60 bits are
/// rejected.
#[cfg(test)]
pub(crate) fn vlq_decode(segment: &str) -> Option<Vec<i64>> {
    let mut values = Vec::new();
    let mut value = 0i64;
    let mut shift = 0;

    for byte in segment.bytes() {
        let digit = BASE64_DIGITS.iter().position(|&d| d == byte)? as i64;
        value += (digit & 0b11111) << shift;

        if digit & 0b100000 != 0 {
            shift += 5;
            if shift > 55 {
                return None;
            }
            continue;
        }

        let negative = value & 1 == 1;
        value >>= 1;
        values.push(if negative { -value } else { value });
        value = 0;
        shift = 0;
    }

    (shift == 0).then_some(values)
}

/// Encode mappings where each generated line maps, at column zero, to the
/// start of one original line.
pub fn encode_line_mappings(lines: &[Option<(u32, u32)>]) -> String {
    let mut out = String::new();
    let mut prev_source = 0i64;
    let mut prev_line = 0i64;

    for (i, line) in lines.iter().enumerate() {
        if i > 0 {
            out.push(';');
        }
        if let Some((source, original)) = line {
            let source = *source as i64;
            let original = *original as i64;
            vlq_encode(0, &mut out);
            vlq_encode(source - prev_source, &mut out);
            vlq_encode(original - prev_line, &mut out);
            vlq_encode(0, &mut out);
            prev_source = source;
            prev_line = original;
        }
    }

    out
}

/// Split a trailing inline source map comment off `contents`.
pub fn extract_inline(
    path: &Utf8Path,
    contents: &str,
) -> Result<(String, Option<SourceMap>), PipelineError> {
    let trimmed = contents.trim_end();
    let start = trimmed.rfind('\n').map(|i| i + 1).unwrap_or(0);
    let last = &trimmed[start..];

    let Some(payload) = last
        .strip_prefix(URL_PREFIX)
        .and_then(|url| url.strip_prefix("data:application/json"))
        .and_then(|url| url.split_once("base64,"))
        .map(|(_, data)| data)
    else {
        return Ok((contents.to_string(), None));
    };

    let json = STANDARD
        .decode(payload.trim())
        .map_err(|err| PipelineError::InlineMap(path.to_owned(), err))?;
    let map = serde_json::from_slice(&json)
        .map_err(|err| PipelineError::SourceMap(path.to_owned(), err))?;

    let mut code = trimmed[..start].to_string();
    if code.ends_with('\n') {
        code.pop();
    }

    Ok((code, Some(map)))
}

/// Load inline maps produced upstream into [`BuildFile::map`].
pub fn init() -> impl Step {
    map_files("sourcemaps:init", |mut file| async move {
        if file.map.is_none() {
            let (code, map) = extract_inline(&file.path, &file.contents)?;
            file.contents = code;
            file.map = map;
        }
        Ok(file)
    })
}

/// Where the write step puts maps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapTarget {
    /// Appended to the file as a `data:` URL.
    Inline,
    /// Emitted as separate `.map` files under `dir`, relative to the file.
    External { dir: Utf8PathBuf, add_comment: bool },
}

/// Serialize maps attached to files according to `target`.
pub fn write(target: MapTarget) -> impl Step {
    from_fn("sourcemaps:write", move |input| {
        input
            .and_then(move |packet| future::ready(write_packet(packet, &target)))
            .map_ok(|packets| stream::iter(packets.into_iter().map(Ok)))
            .try_flatten()
            .boxed()
    })
}

fn write_packet(packet: Packet, target: &MapTarget) -> Result<Vec<Packet>, PipelineError> {
    let Packet::File(mut file) = packet else {
        return Ok(vec![packet]);
    };

    let Some(mut map) = file.map.take() else {
        return Ok(vec![Packet::File(file)]);
    };

    map.file = file.path.file_name().map(str::to_string);
    let to_error = |err| PipelineError::SourceMap(file.path.clone(), err);

    match target {
        MapTarget::Inline => {
            let url = map.to_data_url().map_err(to_error)?;
            file.contents = format!("{}\n{URL_PREFIX}{url}\n", file.contents.trim_end());
            Ok(vec![Packet::File(file)])
        }
        MapTarget::External { dir, add_comment } => {
            let name = format!("{}.map", file.path.file_name().unwrap_or("bundle.js"));
            let map_path = file
                .path
                .parent()
                .unwrap_or(Utf8Path::new(""))
                .join(dir)
                .join(&name);

            let json = map.to_json().map_err(to_error)?;

            if *add_comment {
                file.contents = format!("{}\n{URL_PREFIX}{dir}/{name}\n", file.contents.trim_end());
            }

            Ok(vec![
                Packet::File(file),
                Packet::File(BuildFile::new(map_path, json)),
            ])
        }
    }
}
