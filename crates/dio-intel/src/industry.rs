use serde::Deserialize;

pub const BUILTIN_INDUSTRIES_YAML: &str = include_str!("../data/industries.yaml");

/// Talking points for one industry, fed into the prompt and the fallback report.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IndustryStrategy {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub key_topics: Vec<String>,
    #[serde(default)]
    pub common_objections: Vec<String>,
    #[serde(default)]
    pub terminology: Vec<String>,
    #[serde(default)]
    pub conversation_angles: Vec<String>,
}

impl IndustryStrategy {
    fn names(&self) -> impl Iterator<Item = String> + '_ {
        std::iter::once(normalize_industry(&self.name))
            .chain(self.aliases.iter().map(|a| normalize_industry(a)))
            .filter(|n| !n.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndustryTable {
    default: IndustryStrategy,
    industries: Vec<IndustryStrategy>,
}

impl IndustryTable {
    pub fn builtin() -> Result<Self, serde_yaml::Error> {
        Self::from_yaml(BUILTIN_INDUSTRIES_YAML)
    }

    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    pub fn default_strategy(&self) -> &IndustryStrategy {
        &self.default
    }

    /// Exact name or alias first, then the first entry whose name or alias
    /// appears inside the given industry, else the default strategy.
    pub fn lookup(&self, industry: Option<&str>) -> &IndustryStrategy {
        let wanted = match industry.map(normalize_industry) {
            Some(wanted) if !wanted.is_empty() => wanted,
            _ => return &self.default,
        };

        if let Some(hit) = self.industries.iter().find(|s| s.names().any(|n| n == wanted)) {
            return hit;
        }
        self.industries
            .iter()
            .find(|s| s.names().any(|n| n.len() >= 3 && wanted.contains(&n)))
            .unwrap_or(&self.default)
    }
}

/// Lowercase, punctuation folded to single spaces.
pub fn normalize_industry(input: &str) -> String {
    input
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
