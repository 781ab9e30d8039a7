use std::fmt;
use std::path::PathBuf;

use regex::Regex;

use crate::LoraError;

lazy_static::lazy_static! {
    static ref RE_HUB_SLUG: Regex = Regex::new(r"^[a-zA-Z0-9_-]+/[a-zA-Z0-9_-]+$").unwrap();
    static ref RE_REPLICATE_TAR: Regex = Regex::new(
        r"^https?://replicate\.delivery/[a-zA-Z0-9_-]+/[a-zA-Z0-9_-]+/trained_model\.tar"
    )
    .unwrap();
    static ref RE_HUB_URL: Regex = Regex::new(r"^https?://huggingface\.co").unwrap();
    static ref RE_HUB_URL_REPO: Regex =
        Regex::new(r"^https?://huggingface\.co/([a-zA-Z0-9_-]+/[a-zA-Z0-9_-]+)").unwrap();
    static ref RE_CIVITAI: Regex = Regex::new(
        r"^https?://civitai\.com/api/download/models/[0-9]+\?type=Model&format=SafeTensor"
    )
    .unwrap();
    static ref RE_HTTP: Regex = Regex::new(r"^https?://").unwrap();
}

const ARCHIVE_SUFFIXES: [&str; 3] = [".tar", ".tar.gz", ".tgz"];

/// A LoRA identifier, classified by where its weights live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoraId {
    /// `owner/name` on the Hugging Face hub.
    HubSlug { repo: String },
    /// A Replicate training output, a tarball holding the weights.
    ReplicateTar { url: String },
    /// A direct link to a file inside a hub repo.
    HubUrl { repo: String, weight_name: String },
    /// A CivitAI model download link.
    Civitai { url: String },
    /// Any other HTTP(S) URL to a `.safetensors` file.
    SafetensorsUrl { url: String },
    /// A `.safetensors` file on the local disk.
    LocalFile { path: PathBuf },
    /// A local tarball containing the weights.
    LocalArchive { path: PathBuf },
}

impl LoraId {
    /// Classifies `raw`. The first matching rule wins, so a hub slug is never
    /// mistaken for a relative path and a Replicate tarball is never treated as a
    /// plain URL.
    pub fn parse(raw: &str) -> Result<Self, LoraError> {
        let raw = raw.trim();

        if RE_HUB_SLUG.is_match(raw) {
            return Ok(LoraId::HubSlug {
                repo: raw.to_string(),
            });
        }

        if RE_REPLICATE_TAR.is_match(raw) {
            return Ok(LoraId::ReplicateTar {
                url: raw.to_string(),
            });
        }

        if RE_HUB_URL.is_match(raw) {
            let repo = RE_HUB_URL_REPO
                .captures(raw)
                .and_then(|c| c.get(1))
                .ok_or_else(|| LoraError::InvalidIdentifier(raw.to_string()))?
                .as_str()
                .to_string();
            let path = raw.split(['?', '#']).next().unwrap_or(raw);
            let weight_name = path
                .rsplit('/')
                .next()
                .filter(|name| !name.is_empty())
                .ok_or_else(|| LoraError::InvalidIdentifier(raw.to_string()))?
                .to_string();
            return Ok(LoraId::HubUrl { repo, weight_name });
        }

        if RE_CIVITAI.is_match(raw) {
            return Ok(LoraId::Civitai {
                url: raw.to_string(),
            });
        }

        let is_url = RE_HTTP.is_match(raw);
        if raw.ends_with(".safetensors") {
            return Ok(if is_url {
                LoraId::SafetensorsUrl {
                    url: raw.to_string(),
                }
            } else {
                LoraId::LocalFile {
                    path: PathBuf::from(raw),
                }
            });
        }

        if !is_url && ARCHIVE_SUFFIXES.iter().any(|s| raw.ends_with(s)) {
            return Ok(LoraId::LocalArchive {
                path: PathBuf::from(raw),
            });
        }

        Err(LoraError::InvalidIdentifier(raw.to_string()))
    }

    /// Short label for log lines.
    pub fn describe(&self) -> &'static str {
        match self {
            LoraId::HubSlug { .. } => "HF path",
            LoraId::ReplicateTar { .. } => "Replicate URL",
            LoraId::HubUrl { .. } => "HF URL",
            LoraId::Civitai { .. } => "Civitai URL",
            LoraId::SafetensorsUrl { .. } => "safetensor URL",
            LoraId::LocalFile { .. } => "local file",
            LoraId::LocalArchive { .. } => "local archive",
        }
    }

    /// The string the download cache keys this source by.
    pub fn source_key(&self) -> String {
        match self {
            LoraId::HubSlug { repo } => repo.clone(),
            LoraId::HubUrl { repo, weight_name } => format!("{repo}/{weight_name}"),
            LoraId::ReplicateTar { url }
            | LoraId::Civitai { url }
            | LoraId::SafetensorsUrl { url } => url.clone(),
            LoraId::LocalFile { path } | LoraId::LocalArchive { path } => {
                path.to_string_lossy().into_owned()
            }
        }
    }

    /// Whether a failure to fetch this adapter should skip it instead of failing
    /// the whole request.
    pub fn is_optional(&self) -> bool {
        matches!(self, LoraId::SafetensorsUrl { .. })
    }
}

impl fmt::Display for LoraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoraId::HubSlug { repo } => write!(f, "{repo}"),
            LoraId::HubUrl { repo, weight_name } => write!(f, "{repo}/{weight_name}"),
            LoraId::ReplicateTar { url }
            | LoraId::Civitai { url }
            | LoraId::SafetensorsUrl { url } => write!(f, "{url}"),
            LoraId::LocalFile { path } | LoraId::LocalArchive { path } => {
                write!(f, "{}", path.display())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hub_slug() {
        assert_eq!(
            LoraId::parse("alvdansen/frosting_lane_flux").unwrap(),
            LoraId::HubSlug {
                repo: "alvdansen/frosting_lane_flux".to_string()
            }
        );
    }

    #[test]
    fn replicate_tarball_wins_over_generic_url() {
        let url = "https://replicate.delivery/yhqm/abc123-XYZ/trained_model.tar";
        assert_eq!(
            LoraId::parse(url).unwrap(),
            LoraId::ReplicateTar {
                url: url.to_string()
            }
        );
    }

    #[test]
    fn hub_url_splits_repo_and_file() {
        let id = LoraId::parse(
            "https://huggingface.co/XLabs-AI/flux-RealismLora/resolve/main/lora.safetensors?download=true",
        )
        .unwrap();
        assert_eq!(
            id,
            LoraId::HubUrl {
                repo: "XLabs-AI/flux-RealismLora".to_string(),
                weight_name: "lora.safetensors".to_string(),
            }
        );
    }

    #[test]
    fn source_keys() {
        let url = "https://example.com/a/style.safetensors";
        assert_eq!(LoraId::parse(url).unwrap().source_key(), url);
        assert_eq!(
            LoraId::parse("owner/name").unwrap().source_key(),
            "owner/name"
        );
    }

    #[test]
    fn hub_url_without_repo_is_rejected() {
        assert!(matches!(
            LoraId::parse("https://huggingface.co/models"),
            Err(LoraError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn civitai_download() {
        let url = "https://civitai.com/api/download/models/735063?type=Model&format=SafeTensor";
        assert_eq!(
            LoraId::parse(url).unwrap(),
            LoraId::Civitai {
                url: url.to_string()
            }
        );
    }

    #[test]
    fn civitai_without_format_falls_through_to_invalid() {
        let url = "https://civitai.com/api/download/models/735063";
        assert!(LoraId::parse(url).is_err());
    }

    #[test]
    fn safetensors_url_and_local_file() {
        assert!(matches!(
            LoraId::parse("https://example.com/weights/style.safetensors").unwrap(),
            LoraId::SafetensorsUrl { .. }
        ));
        assert_eq!(
            LoraId::parse("/models/style.safetensors").unwrap(),
            LoraId::LocalFile {
                path: PathBuf::from("/models/style.safetensors")
            }
        );
    }

    #[test]
    fn local_archives() {
        for raw in ["/tmp/lora.tar", "./out/lora.tar.gz", "lora.tgz"] {
            assert!(
                matches!(LoraId::parse(raw).unwrap(), LoraId::LocalArchive { .. }),
                "{raw}"
            );
        }
    }

    #[test]
    fn remote_tar_is_not_a_local_archive() {
        assert!(LoraId::parse("https://example.com/lora.tar").is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        let err = LoraId::parse("not a lora").unwrap_err();
        assert!(err.to_string().contains("not a lora"));
    }

    #[test]
    fn only_plain_urls_are_optional() {
        assert!(LoraId::parse("https://x.io/a.safetensors")
            .unwrap()
            .is_optional());
        assert!(!LoraId::parse("owner/name").unwrap().is_optional());
    }
}
