// display-name validation
use unicode_segmentation::UnicodeSegmentation;

pub const MAX_NAME_GRAPHEMES: usize = 32;

pub fn check_user_name(name: &str) -> Result<(), &'static str> {
    let s = name.trim();
    if s.is_empty() {
        return Err("Please enter your name.");
    }
    if s.graphemes(true).count() > MAX_NAME_GRAPHEMES {
        return Err("Name is too long.");
    }
    if s.chars().any(char::is_control) {
        return Err("Name contains control characters.");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_and_rejects() {
        assert!(check_user_name("Alice").is_ok());
        assert!(check_user_name("  Zoë Ünal ").is_ok());
        assert!(check_user_name("").is_err());
        assert!(check_user_name("   ").is_err());
        assert!(check_user_name("tab\there").is_err());
        assert!(check_user_name(&"x".repeat(33)).is_err());
        assert!(check_user_name(&"é".repeat(32)).is_ok());
    }
}
