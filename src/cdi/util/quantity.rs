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

//! Parsing and formatting for Kubernetes resource quantities (`1Gi`, `500M`, `1073741824`).

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuantityError(String);

impl fmt::Display for QuantityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid quantity '{}'", self.0)
    }
}

impl std::error::Error for QuantityError {}

const BINARY_SUFFIXES: [(&str, u32); 6] = [
    ("Ki", 1),
    ("Mi", 2),
    ("Gi", 3),
    ("Ti", 4),
    ("Pi", 5),
    ("Ei", 6),
];

const DECIMAL_SUFFIXES: [(&str, u32); 6] = [
    ("k", 1),
    ("M", 2),
    ("G", 3),
    ("T", 4),
    ("P", 5),
    ("E", 6),
];

/// Parses a quantity into whole units (bytes for storage), rounding fractions up.
pub fn parse_quantity(input: &str) -> Result<i64, QuantityError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(QuantityError(input.to_string()));
    }

    let (number, multiplier) = split_suffix(trimmed).ok_or_else(|| QuantityError(input.to_string()))?;
    let value: f64 = number
        .parse()
        .map_err(|_| QuantityError(input.to_string()))?;
    if !value.is_finite() {
        return Err(QuantityError(input.to_string()));
    }
    let scaled = (value * multiplier).ceil();
    if scaled > i64::MAX as f64 || scaled < i64::MIN as f64 {
        return Err(QuantityError(input.to_string()));
    }
    Ok(scaled as i64)
}

fn split_suffix(input: &str) -> Option<(&str, f64)> {
    for (suffix, power) in BINARY_SUFFIXES {
        if let Some(number) = input.strip_suffix(suffix) {
            return Some((number, 1024f64.powi(power as i32)));
        }
    }
    for (suffix, power) in DECIMAL_SUFFIXES {
        if let Some(number) = input.strip_suffix(suffix) {
            return Some((number, 1000f64.powi(power as i32)));
        }
    }
    if let Some(number) = input.strip_suffix('m') {
        return Some((number, 0.001));
    }
    if input.contains(['e', 'E']) {
        return Some((input, 1.0));
    }
    if input.chars().all(|c| c.is_ascii_digit() || c == '.' || c == '-' || c == '+') {
        return Some((input, 1.0));
    }
    None
}

/// Formats a byte count using the largest exact binary suffix.
pub fn format_quantity(value: i64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    for (suffix, power) in BINARY_SUFFIXES.iter().rev() {
        let unit = 1024i64.pow(*power);
        if value % unit == 0 {
            return format!("{}{}", value / unit, suffix);
        }
    }
    value.to_string()
}
