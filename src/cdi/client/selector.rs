/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::collections::HashMap;

#[derive(Clone, Debug, Eq, PartialEq)]
enum LabelOperator {
    Equals(String),
    NotEquals(String),
    Exists,
    NotExists,
}

#[derive(Clone, Debug, Eq, PartialEq)]
struct LabelRequirement {
    key: String,
    operator: LabelOperator,
}

impl LabelRequirement {
    fn matches(&self, labels: &HashMap<String, String>) -> bool {
        let actual = labels.get(&self.key);
        match &self.operator {
            LabelOperator::Equals(expected) => actual == Some(expected),
            LabelOperator::NotEquals(expected) => actual != Some(expected),
            LabelOperator::Exists => actual.is_some(),
            LabelOperator::NotExists => actual.is_none(),
        }
    }
}

/// Equality-based label selector (`a=b,c!=d,e,!f`).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LabelSelector {
    requirements: Vec<LabelRequirement>,
}

impl LabelSelector {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut requirements = Vec::new();
        for term in raw.split(',').map(str::trim).filter(|term| !term.is_empty()) {
            let requirement = if let Some((key, value)) = term.split_once("!=") {
                LabelRequirement {
                    key: key.trim().to_string(),
                    operator: LabelOperator::NotEquals(value.trim().to_string()),
                }
            } else if let Some((key, value)) = term.split_once("==").or_else(|| term.split_once('=')) {
                LabelRequirement {
                    key: key.trim().to_string(),
                    operator: LabelOperator::Equals(value.trim().to_string()),
                }
            } else if let Some(key) = term.strip_prefix('!') {
                LabelRequirement {
                    key: key.trim().to_string(),
                    operator: LabelOperator::NotExists,
                }
            } else {
                LabelRequirement {
                    key: term.to_string(),
                    operator: LabelOperator::Exists,
                }
            };
            if requirement.key.is_empty() {
                return Err(format!("invalid label selector term '{term}'"));
            }
            requirements.push(requirement);
        }
        Ok(LabelSelector { requirements })
    }

    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.requirements
            .iter()
            .all(|requirement| requirement.matches(labels))
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }
}
