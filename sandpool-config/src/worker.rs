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

use serde::{Deserialize, Serialize};

use crate::serde_utils::{
    convert_numeric_with_shellexpand, convert_optional_string_with_shellexpand,
    convert_string_with_shellexpand,
};

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct WorkerSpec {
    /// Address to listen on.
    /// Example: `0.0.0.0:5001`
    #[serde(deserialize_with = "convert_string_with_shellexpand")]
    pub listen_address: String,

    /// Address advertised to the controller in heartbeats. When unset the
    /// listen address is used.
    /// Example: `http://worker-3:5001/api`
    #[serde(default, deserialize_with = "convert_optional_string_with_shellexpand")]
    pub self_address: Option<String>,

    /// Base URL of the controller. When unset no heartbeats or cancel
    /// notices are sent.
    /// Example: `http://controller:5000/api`
    #[serde(default, deserialize_with = "convert_optional_string_with_shellexpand")]
    pub controller_address: Option<String>,

    /// Interval between two heartbeats.
    ///
    /// Default: 8
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub heart_rate_s: u64,
}
