#![forbid(unsafe_code)]

/// Checksum of one page image, salted with its file and page number so that a page
/// written to the wrong slot of a snapshot does not verify.
pub fn page_crc32(file_no: u32, page_no: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&file_no.to_be_bytes());
    hasher.update(&page_no.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_crc32_changes_with_components() {
        let payload = vec![0u8; 16];
        let crc_a = page_crc32(1, 2, &payload);
        let crc_b = page_crc32(1, 2, &payload);
        assert_eq!(crc_a, crc_b);

        let mut different = payload.clone();
        different[0] = 1;
        assert_ne!(crc_a, page_crc32(1, 2, &different));
        assert_ne!(crc_a, page_crc32(3, 2, &payload));
        assert_ne!(crc_a, page_crc32(1, 3, &payload));
    }
}
