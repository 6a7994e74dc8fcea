//! Key namespacing
//!
//! Every key the crate touches is `<prefix><domain>:<id>[:<subfield>]`. The
//! prefix is always supplied by the caller and may be empty.

/// Caller-supplied key prefix
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySpace {
  prefix: String,
}

impl KeySpace {
  pub fn new(prefix: impl Into<String>) -> Self {
    Self {
      prefix: prefix.into(),
    }
  }

  pub fn prefix(&self) -> &str {
    &self.prefix
  }

  /// `<prefix><domain>:<id>`
  pub fn key(&self, domain: &str, id: &str) -> String {
    format!("{}{}:{}", self.prefix, domain, id)
  }

  /// `<prefix><domain>:<id>:<subfield>`
  pub fn sub_key(&self, domain: &str, id: &str, subfield: &str) -> String {
    format!("{}{}:{}:{}", self.prefix, domain, id, subfield)
  }

  /// `<prefix><domain>:<id>` or `<prefix><domain>:<id>:<subfield>`
  pub fn entry_key(&self, domain: &str, id: &str, subfield: Option<&str>) -> String {
    match subfield {
      Some(sub) if !sub.is_empty() => self.sub_key(domain, id, sub),
      _ => self.key(domain, id),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_key_layout() {
    let keys = KeySpace::new("test:abc:");
    assert_eq!(keys.key("stock", "p1"), "test:abc:stock:p1");
    assert_eq!(
      keys.sub_key("user", "42", "profile"),
      "test:abc:user:42:profile"
    );
  }

  #[test]
  fn test_empty_prefix() {
    let keys = KeySpace::default();
    assert_eq!(keys.key("price", "p1"), "price:p1");
    assert_eq!(keys.entry_key("user", "7", None), "user:7");
    assert_eq!(keys.entry_key("user", "7", Some("")), "user:7");
    assert_eq!(keys.entry_key("user", "7", Some("profile")), "user:7:profile");
  }
}
