use uuid::Uuid;

/// Generates a record identifier: a UUIDv4 rendered as 32 lowercase hex digits.
pub fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Accepts exactly 32 hex digits or a dashed (8-4-4-4-12) UUIDv4.
pub fn validate_id(id: &str) -> bool {
    match id.len() {
        32 => id.bytes().all(|b| b.is_ascii_hexdigit()),
        36 => {
            let dashed = id
                .char_indices()
                .all(|(i, c)| matches!(i, 8 | 13 | 18 | 23) == (c == '-'));
            dashed
                && Uuid::parse_str(id)
                    .map(|uuid| uuid.get_version_num() == 4)
                    .unwrap_or(false)
        }
        _ => false,
    }
}

/// Normalizes a slash-separated path: backslashes become slashes, repeated
/// separators collapse, `.` segments drop, and leading/trailing slashes go.
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}
