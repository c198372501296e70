// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;

use config::{Config, Language};

/// Per-language binding loaded once at startup: which image to spawn, which command(s) to run.
/// Command templates end with the entry path, matching the calling convention of `python file.py`
/// / `node file.js`; both sandbox runtime drivers treat the final command argument as the program
/// to run.
#[derive(Debug, Clone)]
pub struct LanguageProfile {
    pub image: String,
    pub compile_command: Option<fn(&str) -> Vec<String>>,
    pub entrypoint_command: fn(&str) -> Vec<String>,
    pub extension_whitelist: &'static [&'static str],
}

/// All four supported languages' profiles, keyed by their closed tag. Built once from `Config`
/// and handed to the pipeline as an `Arc`; no per-request string-switch branching.
#[derive(Debug, Clone)]
pub struct LanguageProfiles(HashMap<Language, LanguageProfile>);

impl LanguageProfiles {
    pub fn load(config: &Config) -> Self {
        let mut profiles = HashMap::new();
        for language in Language::ALL {
            let image = config
                .sandbox_image
                .get(language.as_str())
                .cloned()
                .unwrap_or_else(|| format!("code-exec/{}:latest", language.as_str()));
            profiles.insert(language, build_profile(language, image));
        }
        LanguageProfiles(profiles)
    }

    pub fn get(&self, language: Language) -> &LanguageProfile {
        self.0
            .get(&language)
            .expect("LanguageProfiles::load populates every Language::ALL entry")
    }
}

fn build_profile(language: Language, image: String) -> LanguageProfile {
    match language {
        Language::Python => LanguageProfile {
            image,
            compile_command: None,
            entrypoint_command: |entry| vec!["python3".to_string(), entry.to_string()],
            extension_whitelist: &["py"],
        },
        Language::Javascript => LanguageProfile {
            image,
            compile_command: None,
            entrypoint_command: |entry| vec!["node".to_string(), entry.to_string()],
            extension_whitelist: &["js", "mjs"],
        },
        Language::Java => LanguageProfile {
            image,
            compile_command: Some(|entry| vec!["javac".to_string(), entry.to_string()]),
            entrypoint_command: |entry| {
                vec!["java".to_string(), "-cp".to_string(), ".".to_string(), entry.to_string()]
            },
            extension_whitelist: &["java"],
        },
        Language::Cpp => LanguageProfile {
            image,
            compile_command: Some(|entry| {
                vec![
                    "g++".to_string(),
                    "-O2".to_string(),
                    "-o".to_string(),
                    "a.out".to_string(),
                    entry.to_string(),
                ]
            }),
            // The compiled binary takes no arguments: its entry path was only ever needed by
            // the compile step above.
            entrypoint_command: |_entry| vec!["./a.out".to_string()],
            extension_whitelist: &["cpp", "cc", "cxx"],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_supported_language_has_a_profile() {
        let profiles = LanguageProfiles::load(&Config::default());
        for language in Language::ALL {
            let profile = profiles.get(language);
            assert!(!profile.image.is_empty());
            let command = (profile.entrypoint_command)("main");
            if language == Language::Cpp {
                // The compiled binary is run with no arguments; "main" only ever named the
                // source file the compile step consumed.
                assert_eq!(command, vec!["./a.out".to_string()]);
            } else {
                assert_eq!(command.last().unwrap(), "main");
            }
        }
    }

    #[test]
    fn cpp_run_command_does_not_forward_the_source_path() {
        let profiles = LanguageProfiles::load(&Config::default());
        let profile = profiles.get(Language::Cpp);
        assert_eq!(
            (profile.entrypoint_command)("main.cpp"),
            vec!["./a.out".to_string()]
        );
    }
}
