//! Collision-resistant resource names within provider limits.
//!
//! Names are built from an optional prefix, a random v4 UUID rendered as hex,
//! and the project ID with every character outside the provider's alphabet
//! stripped. The result is lowercased and truncated to the provider limit, so
//! the random part always survives truncation before the project part does.

use uuid::Uuid;

use crate::types::ProjectId;

/// Characters a provider accepts in a resource name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alphabet {
    /// `[a-z0-9]`.
    LowerAlnum,
    /// `[a-z0-9-]`.
    LowerAlnumHyphen,
    /// `[a-z0-9_]`.
    LowerAlnumUnderscore,
}

impl Alphabet {
    const fn allows(self, c: char) -> bool {
        match self {
            Self::LowerAlnum => c.is_ascii_lowercase() || c.is_ascii_digit(),
            Self::LowerAlnumHyphen => c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-',
            Self::LowerAlnumUnderscore => {
                c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'
            }
        }
    }
}

/// Naming rule for one kind of provider resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamePolicy {
    prefix: &'static str,
    max_len: usize,
    alphabet: Alphabet,
}

impl NamePolicy {
    /// S3 bucket: 3-63 chars, lowercase, digits, hyphens.
    pub const S3_BUCKET: Self = Self::new("", 63, Alphabet::LowerAlnumHyphen);
    /// OpenSearch domain: 3-28 chars, starts with a letter.
    pub const OPENSEARCH_DOMAIN: Self = Self::new("osdomain", 28, Alphabet::LowerAlnumHyphen);
    /// DynamoDB table.
    pub const DYNAMODB_TABLE: Self = Self::new("table", 63, Alphabet::LowerAlnumHyphen);
    /// BigQuery dataset: letters, digits, underscores.
    pub const BIGQUERY_DATASET: Self = Self::new("dataset", 63, Alphabet::LowerAlnumUnderscore);
    /// BigQuery table.
    pub const BIGQUERY_TABLE: Self = Self::new("table", 63, Alphabet::LowerAlnumUnderscore);
    /// Bigtable instance: 6-33 chars, starts with a letter.
    pub const BIGTABLE_INSTANCE: Self = Self::new("in", 33, Alphabet::LowerAlnumHyphen);
    /// Bigtable cluster: 6-30 chars, starts with a letter.
    pub const BIGTABLE_CLUSTER: Self = Self::new("clust", 30, Alphabet::LowerAlnumHyphen);
    /// Bigtable table.
    pub const BIGTABLE_TABLE: Self = Self::new("table", 50, Alphabet::LowerAlnumHyphen);
    /// Cloud Storage bucket.
    pub const GCS_BUCKET: Self = Self::new("bucket", 63, Alphabet::LowerAlnumHyphen);
    /// Azure resource group.
    pub const RESOURCE_GROUP: Self = Self::new("rg-datalake-", 63, Alphabet::LowerAlnumHyphen);
    /// Azure storage account: 3-24 chars, lowercase letters and digits only.
    pub const STORAGE_ACCOUNT: Self = Self::new("st", 24, Alphabet::LowerAlnum);
    /// ADLS Gen2 filesystem.
    pub const FILESYSTEM: Self = Self::new("fs", 63, Alphabet::LowerAlnumHyphen);

    /// Create a naming rule.
    #[must_use]
    pub const fn new(prefix: &'static str, max_len: usize, alphabet: Alphabet) -> Self {
        Self {
            prefix,
            max_len,
            alphabet,
        }
    }

    /// Maximum name length.
    #[must_use]
    pub const fn max_len(&self) -> usize {
        self.max_len
    }

    /// Generate a fresh name for a resource owned by `project`.
    #[must_use]
    pub fn generate(&self, project: &ProjectId) -> String {
        let token = Uuid::new_v4().simple().to_string();
        let raw = format!("{}{token}{}", self.prefix, project.as_str());

        raw.chars()
            .map(|c| c.to_ascii_lowercase())
            .filter(|&c| self.alphabet.allows(c))
            .take(self.max_len)
            .collect()
    }

    /// Whether `name` satisfies this rule.
    #[must_use]
    pub fn accepts(&self, name: &str) -> bool {
        !name.is_empty()
            && name.len() <= self.max_len
            && name.starts_with(self.prefix)
            && name.chars().all(|c| self.alphabet.allows(c))
    }
}
