// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use chrono::Utc;
use rand::Rng;

fn random_letters(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| {
            let idx = rng.random_range(0..26);
            (b'a' + idx) as char
        })
        .collect()
}

/// Bridge-assigned handle such as `job-20260102-qwertyuiop`.
/// Assigned before anything is sent to the cluster, so it is stable from the first moment.
pub fn generate_handle(prefix: &str) -> String {
    let date = Utc::now().format("%Y%m%d").to_string();
    format!("{}-{}-{}", prefix, date, random_letters(10))
}

/// Short random suffix for temporary file names and session ids.
pub fn random_suffix() -> String {
    random_letters(8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_has_prefix_date_and_letters() {
        let handle = generate_handle("job");
        let parts: Vec<&str> = handle.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "job");
        assert_eq!(parts[1].len(), 8);
        assert!(parts[1].chars().all(|c| c.is_ascii_digit()));
        assert_eq!(parts[2].len(), 10);
        assert!(parts[2].chars().all(|c| c.is_ascii_lowercase()));
    }

    #[test]
    fn handles_differ() {
        assert_ne!(generate_handle("sync"), generate_handle("sync"));
    }
}
