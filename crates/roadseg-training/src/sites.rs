use crate::error::{TrainingError, TrainingResult};
use std::fmt;

/// A geographic acquisition area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Site {
    pub name: &'static str,
    pub aoi: &'static str,
}

impl Site {
    /// Folder holding the labelled training tiles.
    #[must_use]
    pub fn train_folder(&self) -> String {
        format!("{}_Roads_Train", self.aoi)
    }

    /// Folder holding the public test tiles.
    #[must_use]
    pub fn test_folder(&self) -> String {
        format!("{}_Roads_Test_Public", self.aoi)
    }
}

pub const SITES: [Site; 4] = [
    Site { name: "vegas", aoi: "AOI_2_Vegas" },
    Site { name: "paris", aoi: "AOI_3_Paris" },
    Site { name: "shanghai", aoi: "AOI_4_Shanghai" },
    Site { name: "khartoum", aoi: "AOI_5_Khartoum" },
];

/// Which sites a run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteScope {
    All,
    Only(Site),
}

impl SiteScope {
    /// Parses `all` or a site name.
    pub fn parse(value: &str) -> TrainingResult<Self> {
        if value == "all" {
            return Ok(Self::All);
        }
        SITES.iter().find(|s| s.name == value).map(|s| Self::Only(*s)).ok_or_else(|| {
            let known: Vec<&str> = SITES.iter().map(|s| s.name).collect();
            TrainingError::Configuration(format!(
                "unknown site '{value}' (known: all, {})",
                known.join(", ")
            ))
        })
    }

    #[must_use]
    pub fn sites(&self) -> Vec<Site> {
        match self {
            Self::All => SITES.to_vec(),
            Self::Only(site) => vec![*site],
        }
    }

    /// Training folder names covered by this scope.
    #[must_use]
    pub fn train_folders(&self) -> Vec<String> {
        self.sites().iter().map(Site::train_folder).collect()
    }

    /// Public test folder names covered by this scope.
    #[must_use]
    pub fn test_folders(&self) -> Vec<String> {
        self.sites().iter().map(Site::test_folder).collect()
    }
}

impl fmt::Display for SiteScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Only(site) => f.write_str(site.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scope() {
        assert_eq!(SiteScope::parse("all").unwrap().sites().len(), 4);
        let paris = SiteScope::parse("paris").unwrap();
        assert_eq!(paris.train_folders(), vec!["AOI_3_Paris_Roads_Train".to_string()]);
        assert_eq!(paris.test_folders(), vec!["AOI_3_Paris_Roads_Test_Public".to_string()]);
        assert_eq!(paris.to_string(), "paris");
    }

    #[test]
    fn test_unknown_site_is_rejected() {
        assert!(matches!(SiteScope::parse("berlin"), Err(TrainingError::Configuration(_))));
    }
}
