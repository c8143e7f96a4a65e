// Copyright 2025 The Sandpool Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Key layout shared by every process that coordinates on the same
//! namespace. Changing any of these formats breaks mixed-version fleets.

use crate::SessionId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    namespace: String,
}

impl KeySpace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Namespace used when none is configured explicitly.
    pub fn default_namespace(task_name: &str, network_name: &str) -> String {
        format!("sandpool:{task_name}:{network_name}")
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn lock(&self, name: &str) -> String {
        format!("{}:lock:{name}", self.namespace)
    }

    pub fn allocation(&self, container_id: &str, session_id: SessionId) -> String {
        format!(
            "{}:container:{container_id}:allocation:{session_id}",
            self.namespace
        )
    }

    pub fn allocation_pattern(&self, container_id: &str) -> String {
        format!("{}:container:{container_id}:allocation:*", self.namespace)
    }

    pub fn uses(&self, container_id: &str) -> String {
        format!("{}:container:{container_id}:uses", self.namespace)
    }

    pub fn all_uses_pattern(&self) -> String {
        format!("{}:container:*:uses", self.namespace)
    }

    /// Inverse of [`Self::uses`].
    pub fn container_from_uses<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.namespace.as_str())?
            .strip_prefix(":container:")?
            .strip_suffix(":uses")
    }

    pub fn container_pattern(&self, container_id: &str) -> String {
        format!("{}:container:{container_id}:*", self.namespace)
    }

    pub fn session(&self, session_id: SessionId) -> String {
        format!("{}:session:{session_id}", self.namespace)
    }

    pub fn session_counter(&self) -> String {
        format!("{}:session_id", self.namespace)
    }
}
