use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

const VOICE_CONVERSION_PREFIX: &str = "voice_conversion_models/";
const DIRECT_CLONING_FAMILY: &str = "xtts";

/// What a loaded model can do, decided once when the model is loaded.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelCapability {
    /// Clones a voice straight from reference audio (XTTS family).
    DirectCloning,
    /// Converts existing audio into a target voice; cannot read text.
    VoiceConversionOnly,
    /// Ships a fixed set of named speakers.
    MultiSpeaker,
    SingleSpeaker,
}

impl ModelCapability {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ModelCapability::DirectCloning => "direct_cloning",
            ModelCapability::VoiceConversionOnly => "voice_conversion_only",
            ModelCapability::MultiSpeaker => "multi_speaker",
            ModelCapability::SingleSpeaker => "single_speaker",
        }
    }

    pub const fn reads_text(&self) -> bool {
        !matches!(self, ModelCapability::VoiceConversionOnly)
    }
}

impl fmt::Display for ModelCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelCapability {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct_cloning" | "direct-cloning" | "cloning" => Ok(ModelCapability::DirectCloning),
            "voice_conversion_only" | "voice-conversion" | "vc" => {
                Ok(ModelCapability::VoiceConversionOnly)
            }
            "multi_speaker" | "multi-speaker" => Ok(ModelCapability::MultiSpeaker),
            "single_speaker" | "single-speaker" => Ok(ModelCapability::SingleSpeaker),
            _ => Err(()),
        }
    }
}

/// Capability plus the speaker/language metadata a model exposed at load time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelProfile {
    pub capability: ModelCapability,
    pub multilingual: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speakers: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub languages: Option<Vec<String>>,
}

impl ModelProfile {
    /// Classifies a model from its identifier and the attributes the loaded
    /// engine exposes. Empty speaker or language lists count as absent.
    pub fn infer(
        model_name: &str,
        speakers: Option<Vec<String>>,
        languages: Option<Vec<String>>,
    ) -> Self {
        let speakers = speakers.filter(|list| !list.is_empty());
        let languages = languages.filter(|list| !list.is_empty());

        let capability = if model_name.starts_with(VOICE_CONVERSION_PREFIX) {
            ModelCapability::VoiceConversionOnly
        } else if model_name
            .to_ascii_lowercase()
            .contains(DIRECT_CLONING_FAMILY)
        {
            ModelCapability::DirectCloning
        } else if speakers.is_some() {
            ModelCapability::MultiSpeaker
        } else {
            ModelCapability::SingleSpeaker
        };

        Self {
            capability,
            multilingual: languages.is_some(),
            speakers,
            languages,
        }
    }

    pub fn is_multi_speaker(&self) -> bool {
        self.speakers.is_some()
    }

    pub fn has_speaker(&self, speaker: &str) -> bool {
        self.speakers
            .as_ref()
            .map(|list| list.iter().any(|candidate| candidate == speaker))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(values: &[&str]) -> Option<Vec<String>> {
        Some(values.iter().map(|v| v.to_string()).collect())
    }

    #[test]
    fn xtts_is_direct_cloning_and_multilingual() {
        let profile = ModelProfile::infer(
            "tts_models/multilingual/multi-dataset/xtts_v2",
            names(&["Claribel Dervla"]),
            names(&["en", "de"]),
        );
        assert_eq!(profile.capability, ModelCapability::DirectCloning);
        assert!(profile.multilingual);
        assert!(profile.is_multi_speaker());
    }

    #[test]
    fn vctk_vits_is_multi_speaker() {
        let profile = ModelProfile::infer("tts_models/en/vctk/vits", names(&["p225", "p226"]), None);
        assert_eq!(profile.capability, ModelCapability::MultiSpeaker);
        assert!(!profile.multilingual);
        assert!(profile.has_speaker("p226"));
        assert!(!profile.has_speaker("p999"));
    }

    #[test]
    fn freevc_is_conversion_only() {
        let profile =
            ModelProfile::infer("voice_conversion_models/multilingual/vctk/freevc24", None, None);
        assert_eq!(profile.capability, ModelCapability::VoiceConversionOnly);
        assert!(!profile.capability.reads_text());
    }

    #[test]
    fn empty_lists_are_treated_as_absent() {
        let profile =
            ModelProfile::infer("tts_models/en/ljspeech/vits", Some(Vec::new()), Some(Vec::new()));
        assert_eq!(profile.capability, ModelCapability::SingleSpeaker);
        assert!(profile.speakers.is_none());
        assert!(!profile.multilingual);
    }

    #[test]
    fn capability_round_trips_through_str() {
        for capability in [
            ModelCapability::DirectCloning,
            ModelCapability::VoiceConversionOnly,
            ModelCapability::MultiSpeaker,
            ModelCapability::SingleSpeaker,
        ] {
            assert_eq!(capability.as_str().parse::<ModelCapability>(), Ok(capability));
        }
        assert!("unknown".parse::<ModelCapability>().is_err());
    }
}
