/*
 * Copyright (C) 2024 The Fleetctl Authors
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


use rand::Rng;

/// Maximum length of a DNS-1123 subdomain.
pub const DNS1123_SUBDOMAIN_MAX_LENGTH: usize = 253;

/// Length of the random suffix appended to generated names.
pub const GENERATED_SUFFIX_LENGTH: usize = 5;

// Vowels and lookalike digits are left out so suffixes never spell words.
const SUFFIX_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

/// Returns true when `value` is a lowercase RFC 1123 subdomain.
pub fn is_dns1123_subdomain(value: &str) -> bool {
    if value.is_empty() || value.len() > DNS1123_SUBDOMAIN_MAX_LENGTH {
        return false;
    }
    value.split('.').all(is_dns1123_label_part)
}

fn is_dns1123_label_part(part: &str) -> bool {
    let bytes = part.as_bytes();
    let (Some(first), Some(last)) = (bytes.first(), bytes.last()) else {
        return false;
    };
    if !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() {
        return false;
    }
    bytes
        .iter()
        .all(|byte| byte.is_ascii_digit() || byte.is_ascii_lowercase() || *byte == b'-')
}

/// Validates a name that will be used as a `generateName` prefix. A trailing
/// dash is allowed because the generated suffix follows it.
pub fn is_valid_name_prefix(prefix: &str) -> bool {
    match prefix.strip_suffix('-') {
        Some(stem) => is_dns1123_subdomain(&format!("{}a", stem)),
        None => is_dns1123_subdomain(prefix),
    }
}

/// Derives the `generateName` prefix for objects owned by `parent_name`.
pub fn generate_name_prefix(parent_name: &str) -> String {
    let prefix = format!("{}-", parent_name);
    if is_valid_name_prefix(&prefix) {
        prefix
    } else {
        parent_name.to_string()
    }
}

/// Resolves a generated name client-side, the way the API server would.
/// Long prefixes are cut so the result stays a valid subdomain length.
pub fn generate_name(prefix: &str) -> String {
    let limit = DNS1123_SUBDOMAIN_MAX_LENGTH - GENERATED_SUFFIX_LENGTH - 1;
    let base = match prefix.char_indices().nth(limit) {
        Some((cut, _)) => &prefix[..cut],
        None => prefix,
    };
    let base = base.trim_end_matches(|c| c == '.' || c == '-');

    let mut name = String::with_capacity(base.len() + GENERATED_SUFFIX_LENGTH + 1);
    name.push_str(base);
    if !base.is_empty() {
        name.push('-');
    }
    name.push_str(&random_suffix(GENERATED_SUFFIX_LENGTH));
    name
}

pub fn random_suffix(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())] as char)
        .collect()
}

/// Maps every byte of `value` onto the suffix alphabet. The result is label
/// safe and cannot spell words.
pub fn safe_encode(value: &str) -> String {
    value
        .bytes()
        .map(|byte| SUFFIX_ALPHABET[byte as usize % SUFFIX_ALPHABET.len()] as char)
        .collect()
}

/// Random RFC 4122 version 4 identifier.
pub fn random_uid() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    let hex: String = bytes.iter().map(|byte| format!("{:02x}", byte)).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}
