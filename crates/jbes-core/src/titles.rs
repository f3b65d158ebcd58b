//! Free-text job title to canonical role family mapping, plus the title
//! similarity used by repost matching.

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::ParseEnumError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoleFamily {
    SoftwareEngineer,
    DataScientist,
    ProductManager,
    Designer,
    DevopsInfrastructure,
    QaTesting,
    BusinessAnalyst,
    Sales,
    Marketing,
    Operations,
    Finance,
    Hr,
    Executive,
    Other,
}

string_enum!(RoleFamily, "role family", {
    SoftwareEngineer => "software-engineer",
    DataScientist => "data-scientist",
    ProductManager => "product-manager",
    Designer => "designer",
    DevopsInfrastructure => "devops-infrastructure",
    QaTesting => "qa-testing",
    BusinessAnalyst => "business-analyst",
    Sales => "sales",
    Marketing => "marketing",
    Operations => "operations",
    Finance => "finance",
    Hr => "hr",
    Executive => "executive",
    Other => "other",
});

impl RoleFamily {
    pub const ALL: [RoleFamily; 14] = [
        RoleFamily::SoftwareEngineer,
        RoleFamily::DataScientist,
        RoleFamily::ProductManager,
        RoleFamily::Designer,
        RoleFamily::DevopsInfrastructure,
        RoleFamily::QaTesting,
        RoleFamily::BusinessAnalyst,
        RoleFamily::Sales,
        RoleFamily::Marketing,
        RoleFamily::Operations,
        RoleFamily::Finance,
        RoleFamily::Hr,
        RoleFamily::Executive,
        RoleFamily::Other,
    ];
}

pub struct RoleFamilyDef {
    pub family: RoleFamily,
    pub keywords: &'static [&'static str],
    pub exclude_keywords: &'static [&'static str],
}

/// Families are tried in this order; the first keyword hit without an
/// exclude hit wins.
pub static ROLE_FAMILIES: &[RoleFamilyDef] = &[
    RoleFamilyDef {
        family: RoleFamily::SoftwareEngineer,
        keywords: &[
            "software engineer",
            "developer",
            "programmer",
            "backend",
            "frontend",
            "full stack",
            "fullstack",
            "code",
            "coding",
            "python",
            "javascript",
            "java",
            "c++",
            "golang",
            "rust",
            "typescript",
            "node",
            "react",
            "angular",
            "vue",
            "spring",
            "rails",
            "django",
            "senior software engineer",
            "junior developer",
            "lead engineer",
            "principal engineer",
            "software architect",
            "systems engineer",
        ],
        exclude_keywords: &[
            "qa",
            "test",
            "quality assurance",
            "manager",
            "product manager",
            "technical writer",
        ],
    },
    RoleFamilyDef {
        family: RoleFamily::DataScientist,
        keywords: &[
            "data scientist",
            "machine learning",
            "ml engineer",
            "ai engineer",
            "artificial intelligence",
            "deep learning",
            "nlp",
            "computer vision",
            "analytics",
            "data analyst",
            "big data",
            "spark",
            "hadoop",
            "tensorflow",
            "pytorch",
            "scikit",
            "python data",
            "r programmer",
            "statistical",
            "predictive model",
        ],
        exclude_keywords: &["sales analyst", "business analyst"],
    },
    RoleFamilyDef {
        family: RoleFamily::ProductManager,
        keywords: &[
            "product manager",
            "product management",
            "pm",
            "senior product manager",
            "principal product manager",
            "associate product manager",
            "apm",
            "product owner",
            "product lead",
            "product strategy",
        ],
        exclude_keywords: &[],
    },
    RoleFamilyDef {
        family: RoleFamily::Designer,
        keywords: &[
            "designer",
            "ux designer",
            "ui designer",
            "ux/ui",
            "interaction designer",
            "product designer",
            "design system",
            "graphic designer",
            "creative",
            "visual design",
            "motion designer",
            "design lead",
            "design director",
            "design manager",
        ],
        exclude_keywords: &["software", "engineer"],
    },
    RoleFamilyDef {
        family: RoleFamily::DevopsInfrastructure,
        keywords: &[
            "devops",
            "infrastructure",
            "sre",
            "site reliability",
            "cloud engineer",
            "aws",
            "azure",
            "gcp",
            "kubernetes",
            "docker",
            "terraform",
            "ansible",
            "cloud architecture",
            "platform engineer",
            "systems administrator",
            "network engineer",
        ],
        exclude_keywords: &[],
    },
    RoleFamilyDef {
        family: RoleFamily::QaTesting,
        keywords: &[
            "qa",
            "quality assurance",
            "test engineer",
            "tester",
            "automation",
            "selenium",
            "cypress",
            "test automation",
            "qa automation",
            "qa engineer",
            "quality engineer",
            "manual testing",
            "test lead",
        ],
        exclude_keywords: &[],
    },
    RoleFamilyDef {
        family: RoleFamily::BusinessAnalyst,
        keywords: &[
            "business analyst",
            "business analysis",
            "ba",
            "requirement",
            "requirements analyst",
            "solutions analyst",
            "systems analyst",
        ],
        exclude_keywords: &["data analyst", "sales analyst"],
    },
    RoleFamilyDef {
        family: RoleFamily::Sales,
        keywords: &[
            "sales",
            "account executive",
            "account manager",
            "sales engineer",
            "sales director",
            "sales manager",
            "business development",
            "enterprise sales",
            "saas sales",
        ],
        exclude_keywords: &["inside sales"],
    },
    RoleFamilyDef {
        family: RoleFamily::Marketing,
        keywords: &[
            "marketing",
            "product marketing",
            "growth",
            "content marketing",
            "marketing manager",
            "marketing director",
            "digital marketing",
            "seo",
            "sem",
            "marketing analyst",
        ],
        exclude_keywords: &[],
    },
    RoleFamilyDef {
        family: RoleFamily::Operations,
        keywords: &[
            "operations",
            "ops",
            "operations manager",
            "operations director",
            "recruiting",
            "recruiter",
            "talent acquisition",
            "talent",
            "supply chain",
        ],
        exclude_keywords: &[],
    },
    RoleFamilyDef {
        family: RoleFamily::Finance,
        keywords: &[
            "finance",
            "accountant",
            "accounting",
            "financial analyst",
            "cpa",
            "controller",
            "cfo",
            "treasurer",
        ],
        exclude_keywords: &[],
    },
    RoleFamilyDef {
        family: RoleFamily::Hr,
        keywords: &[
            "human resources",
            "hr",
            "hr manager",
            "people operations",
            "culture",
            "people",
            "compensation",
            "benefits",
        ],
        exclude_keywords: &[],
    },
    RoleFamilyDef {
        family: RoleFamily::Executive,
        keywords: &[
            "ceo",
            "coo",
            "cto",
            "vp",
            "vice president",
            "president",
            "founder",
            "executive",
            "c-level",
        ],
        exclude_keywords: &[],
    },
];

pub fn normalize_job_title(title: &str) -> RoleFamily {
    let lower = title.trim().to_lowercase();
    ROLE_FAMILIES
        .iter()
        .find(|def| {
            def.keywords.iter().any(|k| lower.contains(k))
                && !def.exclude_keywords.iter().any(|k| lower.contains(k))
        })
        .map(|def| def.family)
        .unwrap_or(RoleFamily::Other)
}

/// Normalized edit-distance similarity in `[0, 1]`. Titles that land in the
/// same non-`Other` family never score below 0.9.
pub fn title_similarity(a: &str, b: &str) -> f64 {
    let lexical = string_similarity(a, b);
    let family = normalize_job_title(a);
    if family != RoleFamily::Other && family == normalize_job_title(b) {
        lexical.max(0.9)
    } else {
        lexical
    }
}

/// `1 - levenshtein / max_len` over lowercased input.
pub fn string_similarity(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(&a.to_lowercase(), &b.to_lowercase())
}

pub fn group_titles_by_family<'a>(
    titles: impl IntoIterator<Item = &'a str>,
) -> IndexMap<RoleFamily, Vec<&'a str>> {
    let mut grouped: IndexMap<RoleFamily, Vec<&'a str>> =
        RoleFamily::ALL.iter().map(|f| (*f, Vec::new())).collect();
    for title in titles {
        grouped
            .entry(normalize_job_title(title))
            .or_default()
            .push(title);
    }
    grouped
}

pub fn role_family_counts<'a>(
    titles: impl IntoIterator<Item = &'a str>,
) -> IndexMap<RoleFamily, usize> {
    group_titles_by_family(titles)
        .into_iter()
        .map(|(family, titles)| (family, titles.len()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn titles_map_to_first_matching_family() {
        assert_eq!(normalize_job_title("Senior Software Engineer"), RoleFamily::SoftwareEngineer);
        assert_eq!(normalize_job_title("  Data Scientist "), RoleFamily::DataScientist);
        assert_eq!(normalize_job_title("Product Manager"), RoleFamily::ProductManager);
        assert_eq!(normalize_job_title("UX Designer"), RoleFamily::Designer);
        assert_eq!(normalize_job_title("Kubernetes Platform Engineer"), RoleFamily::DevopsInfrastructure);
        assert_eq!(normalize_job_title("Registered Nurse"), RoleFamily::Other);
    }

    #[test]
    fn exclude_keywords_push_title_to_later_family() {
        // "qa" excludes software-engineer even though "developer" matches.
        assert_eq!(normalize_job_title("QA Developer"), RoleFamily::QaTesting);
        assert_eq!(normalize_job_title("Technical Writer (Java)"), RoleFamily::Other);
    }

    #[test]
    fn same_family_titles_get_similarity_floor() {
        let sim = title_similarity("Backend Developer", "Frontend Developer (React)");
        assert!(sim >= 0.9, "sim={sim}");
        assert!((title_similarity("Rust Developer", "rust developer") - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn other_family_uses_plain_edit_distance() {
        let sim = title_similarity("Registered Nurse", "Registered Nurse II");
        let expected = 1.0 - 3.0 / 19.0;
        assert!((sim - expected).abs() < 1e-9, "sim={sim}");
        assert_eq!(string_similarity("", ""), 1.0);
    }

    #[test]
    fn grouping_keeps_every_family_in_declared_order() {
        let counts = role_family_counts(["Rust Developer", "Java Developer", "SEO Lead"]);
        assert_eq!(counts.len(), RoleFamily::ALL.len());
        assert_eq!(counts.get_index(0), Some((&RoleFamily::SoftwareEngineer, &2)));
        assert_eq!(counts[&RoleFamily::Marketing], 1);
        assert_eq!(counts[&RoleFamily::Other], 0);
    }

    #[test]
    fn slug_parses_back_to_family() {
        for family in RoleFamily::ALL {
            assert_eq!(family.as_str().parse::<RoleFamily>().unwrap(), family);
        }
    }
}
