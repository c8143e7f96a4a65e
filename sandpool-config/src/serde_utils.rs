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

//! Deserializers that run `${VAR}` expansion over config values, so secrets
//! and host specific settings can come from the environment.

use core::fmt;
use core::marker::PhantomData;
use core::str::FromStr;
use std::collections::HashMap;

use serde::{Deserialize, Deserializer, de};

fn expand<E: de::Error>(raw: &str) -> Result<String, E> {
    shellexpand::env(raw)
        .map(|expanded| expanded.into_owned())
        .map_err(E::custom)
}

fn number_from_i64<T, E>(v: i64) -> Result<T, E>
where
    T: TryFrom<i64>,
    <T as TryFrom<i64>>::Error: fmt::Display,
    E: de::Error,
{
    T::try_from(v).map_err(E::custom)
}

fn number_from_str<T, E>(v: &str) -> Result<T, E>
where
    T: FromStr,
    <T as FromStr>::Err: fmt::Display,
    E: de::Error,
{
    expand::<E>(v)?.trim().parse::<T>().map_err(E::custom)
}

/// Accepts `8`, `"8"` or `"${POOL_SIZE}"`. `None` is only produced when
/// `OPTIONAL` is set and the value is null or an empty string.
struct NumberVisitor<T, const OPTIONAL: bool>(PhantomData<T>);

impl<T, const OPTIONAL: bool> de::Visitor<'_> for NumberVisitor<T, OPTIONAL>
where
    T: TryFrom<i64> + FromStr,
    <T as TryFrom<i64>>::Error: fmt::Display,
    <T as FromStr>::Err: fmt::Display,
{
    type Value = Option<T>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        if OPTIONAL {
            formatter.write_str("null, an integer or a string holding an integer")
        } else {
            formatter.write_str("an integer or a string holding an integer")
        }
    }

    fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
        if OPTIONAL {
            return Ok(None);
        }
        Err(E::invalid_type(de::Unexpected::Unit, &self))
    }

    fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
        de::Visitor::visit_unit(self)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        number_from_i64(v).map(Some)
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        let v = i64::try_from(v).map_err(E::custom)?;
        number_from_i64(v).map(Some)
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        if OPTIONAL && v.is_empty() {
            return Ok(None);
        }
        number_from_str(v).map(Some)
    }
}

pub fn convert_numeric_with_shellexpand<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<i64> + FromStr,
    <T as TryFrom<i64>>::Error: fmt::Display,
    <T as FromStr>::Err: fmt::Display,
{
    deserializer
        .deserialize_any(NumberVisitor::<T, false>(PhantomData))?
        .ok_or_else(|| de::Error::custom("missing number"))
}

pub fn convert_optional_numeric_with_shellexpand<'de, D, T>(
    deserializer: D,
) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<i64> + FromStr,
    <T as TryFrom<i64>>::Error: fmt::Display,
    <T as FromStr>::Err: fmt::Display,
{
    deserializer.deserialize_any(NumberVisitor::<T, true>(PhantomData))
}

pub fn convert_string_with_shellexpand<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<String, D::Error> {
    expand(&String::deserialize(deserializer)?)
}

pub fn convert_optional_string_with_shellexpand<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    Option::<String>::deserialize(deserializer)?
        .map(|raw| expand(&raw))
        .transpose()
}

/// Used for container commands and environment lists.
pub fn convert_vec_string_with_shellexpand<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Vec<String>, D::Error> {
    Vec::<String>::deserialize(deserializer)?
        .iter()
        .map(|raw| expand(raw))
        .collect()
}

/// Expands the values (not the keys) of a string map, used for container
/// environment blocks that may reference host secrets.
pub fn convert_string_map_with_shellexpand<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<HashMap<String, String>, D::Error> {
    HashMap::<String, String>::deserialize(deserializer)?
        .into_iter()
        .map(|(key, raw)| Ok((key, expand(&raw)?)))
        .collect()
}
