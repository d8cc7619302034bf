//! Per-provider page profiles. Selector literals live here as data; the
//! scraping logic in `profiled.rs` is shared by every provider.

use rootline_common::Provider;

#[derive(Debug)]
pub struct LoginSelectors {
    pub username: &'static str,
    pub password: &'static str,
    pub submit: &'static str,
}

#[derive(Debug)]
pub struct FieldSelectors {
    pub name: &'static str,
    pub gender: &'static str,
    pub birth_date: &'static str,
    pub birth_place: &'static str,
    pub death_date: &'static str,
    pub death_place: &'static str,
    pub photo: &'static str,
}

#[derive(Debug)]
pub struct ParentSelectors {
    /// Link labelled as the father.
    pub father: &'static str,
    /// Link labelled as the mother.
    pub mother: &'static str,
    /// Untagged person links in the parents section, used when neither role
    /// selector matches.
    pub section: &'static str,
}

#[derive(Debug)]
pub enum TreeListing {
    /// The provider hosts one collaborative tree.
    Shared(&'static str),
    /// The user owns trees, linked from an index page.
    Page {
        url: &'static str,
        links: &'static str,
        id_pattern: &'static str,
    },
}

#[derive(Debug)]
pub struct ProviderProfile {
    pub provider: Provider,
    pub home_url: &'static str,
    pub login_url: &'static str,
    /// A URL containing this fragment means the session was bounced to login.
    pub login_redirect_marker: &'static str,
    /// Person page URL with an `{id}` placeholder.
    pub person_url: &'static str,
    /// Separate family view with an `{id}` placeholder, for providers that
    /// do not list parents on the person page.
    pub family_url: Option<&'static str>,
    /// Present only for a signed-in session.
    pub logged_in: &'static str,
    pub login: LoginSelectors,
    pub fields: FieldSelectors,
    pub parents: ParentSelectors,
    pub spouses: &'static str,
    /// Regex whose first capture group is the external ID inside a person href.
    pub id_pattern: &'static str,
    pub trees: TreeListing,
}

impl ProviderProfile {
    pub fn person_url(&self, external_id: &str) -> String {
        self.person_url.replace("{id}", external_id)
    }

    pub fn family_url(&self, external_id: &str) -> Option<String> {
        self.family_url.map(|url| url.replace("{id}", external_id))
    }

    pub fn is_login_redirect(&self, url: &str) -> bool {
        url.contains(self.login_redirect_marker)
    }
}

pub fn profile(provider: Provider) -> &'static ProviderProfile {
    match provider {
        Provider::FamilySearch => &FAMILYSEARCH,
        Provider::Ancestry => &ANCESTRY,
        Provider::MyHeritage => &MYHERITAGE,
        Provider::Geni => &GENI,
        Provider::WikiTree => &WIKITREE,
        Provider::FindAGrave => &FINDAGRAVE,
    }
}

static FAMILYSEARCH: ProviderProfile = ProviderProfile {
    provider: Provider::FamilySearch,
    home_url: "https://www.familysearch.org/tree/overview",
    login_url: "https://www.familysearch.org/auth/familysearch/login",
    login_redirect_marker: "ident.familysearch.org",
    person_url: "https://www.familysearch.org/tree/person/details/{id}",
    family_url: None,
    logged_in: "[data-testid='user-menu']",
    login: LoginSelectors {
        username: "#userName",
        password: "#password",
        submit: "#login",
    },
    fields: FieldSelectors {
        name: "[data-testid='full-name']",
        gender: "[data-testid='sex-value']",
        birth_date: "[data-testid='birth-date']",
        birth_place: "[data-testid='birth-place']",
        death_date: "[data-testid='death-date']",
        death_place: "[data-testid='death-place']",
        photo: "[data-testid='portrait'] img",
    },
    parents: ParentSelectors {
        father: "[data-testid='parent-father'] a[href*='/tree/person/']",
        mother: "[data-testid='parent-mother'] a[href*='/tree/person/']",
        section: "[data-testid='parents-and-siblings'] a[href*='/tree/person/']",
    },
    spouses: "[data-testid='spouse'] a[href*='/tree/person/']",
    id_pattern: r"/tree/person/(?:details/)?([A-Z0-9]{4}-[A-Z0-9]{3,4})",
    trees: TreeListing::Shared("FamilySearch Family Tree"),
};

static ANCESTRY: ProviderProfile = ProviderProfile {
    provider: Provider::Ancestry,
    home_url: "https://www.ancestry.com/family-tree/trees",
    login_url: "https://www.ancestry.com/account/signin",
    login_redirect_marker: "/account/signin",
    person_url: "https://www.ancestry.com/family-tree/person/{id}/facts",
    family_url: None,
    logged_in: "#navAccount",
    login: LoginSelectors {
        username: "#username",
        password: "#password",
        submit: "#signInBtn",
    },
    fields: FieldSelectors {
        name: "h1.userCardTitle",
        gender: ".userCardGender",
        birth_date: "#BirthFact .factItemDate",
        birth_place: "#BirthFact .factItemLocation",
        death_date: "#DeathFact .factItemDate",
        death_place: "#DeathFact .factItemLocation",
        photo: ".userCardImg img",
    },
    parents: ParentSelectors {
        father: ".researchListFamily [data-relation='father'] a.userCardName",
        mother: ".researchListFamily [data-relation='mother'] a.userCardName",
        section: ".researchListFamily .parentsSection a.userCardName",
    },
    spouses: ".researchListFamily [data-relation='spouse'] a.userCardName",
    id_pattern: r"/family-tree/person/((?:tree/\d+/person/)?\d+)",
    trees: TreeListing::Page {
        url: "https://www.ancestry.com/family-tree/trees",
        links: "a.treeLink",
        id_pattern: r"/family-tree/tree/(\d+)",
    },
};

static MYHERITAGE: ProviderProfile = ProviderProfile {
    provider: Provider::MyHeritage,
    home_url: "https://www.myheritage.com/family-trees",
    login_url: "https://www.myheritage.com/login",
    login_redirect_marker: "/login",
    person_url: "https://www.myheritage.com/person-{id}",
    family_url: None,
    logged_in: ".user_menu_container",
    login: LoginSelectors {
        username: "input[name='email']",
        password: "input[name='password']",
        submit: "button[type='submit']",
    },
    fields: FieldSelectors {
        name: ".profile_header .name",
        gender: ".profile_header .gender",
        birth_date: ".event_birth .event_date",
        birth_place: ".event_birth .event_place",
        death_date: ".event_death .event_date",
        death_place: ".event_death .event_place",
        photo: ".profile_photo img",
    },
    parents: ParentSelectors {
        father: ".immediate_family .relation_father a.person_link",
        mother: ".immediate_family .relation_mother a.person_link",
        section: ".immediate_family .parents a.person_link",
    },
    spouses: ".immediate_family .relation_spouse a.person_link",
    id_pattern: r"/person-(\d+_\d+_\d+)",
    trees: TreeListing::Page {
        url: "https://www.myheritage.com/family-trees",
        links: "a.tree_link",
        id_pattern: r"/site-family-tree-(\d+)",
    },
};

static GENI: ProviderProfile = ProviderProfile {
    provider: Provider::Geni,
    home_url: "https://www.geni.com/home",
    login_url: "https://www.geni.com/login",
    login_redirect_marker: "/login",
    person_url: "https://www.geni.com/people/{id}",
    family_url: None,
    logged_in: "#header_user_menu",
    login: LoginSelectors {
        username: "#profile_username",
        password: "#password",
        submit: "#login_form input[type='submit']",
    },
    fields: FieldSelectors {
        name: "#name h2",
        gender: "#gender",
        birth_date: "#birth_date",
        birth_place: "#birth_location",
        death_date: "#death_date",
        death_place: "#death_location",
        photo: "#profile_photo img",
    },
    parents: ParentSelectors {
        father: "#family_handprint [data-relation='father'] a",
        mother: "#family_handprint [data-relation='mother'] a",
        section: "#family_handprint .parents a",
    },
    spouses: "#family_handprint [data-relation='spouse'] a",
    id_pattern: r"/people/(?:[^/]+/)?(\d{6,})",
    trees: TreeListing::Shared("Geni World Family Tree"),
};

static WIKITREE: ProviderProfile = ProviderProfile {
    provider: Provider::WikiTree,
    home_url: "https://www.wikitree.com/index.php?title=Special:MyWikiTree",
    login_url: "https://www.wikitree.com/index.php?title=Special:Userlogin",
    login_redirect_marker: "Special:Userlogin",
    person_url: "https://www.wikitree.com/wiki/{id}",
    family_url: None,
    logged_in: "#header .user-menu",
    login: LoginSelectors {
        username: "#wpEmail",
        password: "#wpPassword1",
        submit: "#wpLoginattempt",
    },
    fields: FieldSelectors {
        name: "h1 span[itemprop='name']",
        gender: "meta[itemprop='gender']",
        birth_date: "time[itemprop='birthDate']",
        birth_place: "span[itemprop='birthPlace']",
        death_date: "time[itemprop='deathDate']",
        death_place: "span[itemprop='deathPlace']",
        photo: ".VITALS img.photo",
    },
    parents: ParentSelectors {
        father: "span[itemprop='parent'][data-role='father'] a",
        mother: "span[itemprop='parent'][data-role='mother'] a",
        section: "span[itemprop='parent'] a",
    },
    spouses: "span[itemprop='spouse'] a",
    id_pattern: r"/wiki/([A-Za-z'\-]+-\d+)",
    trees: TreeListing::Shared("WikiTree"),
};

static FINDAGRAVE: ProviderProfile = ProviderProfile {
    provider: Provider::FindAGrave,
    home_url: "https://www.findagrave.com/user/profile",
    login_url: "https://www.findagrave.com/auth/login",
    login_redirect_marker: "/auth/login",
    person_url: "https://www.findagrave.com/memorial/{id}",
    family_url: None,
    logged_in: "#userNavButton",
    login: LoginSelectors {
        username: "#userName",
        password: "#password",
        submit: "#LoginForm button[type='submit']",
    },
    fields: FieldSelectors {
        name: "#bio-name",
        gender: "#bio-gender",
        birth_date: "#birthDateLabel",
        birth_place: "#birthLocationLabel",
        death_date: "#deathDateLabel",
        death_place: "#deathLocationLabel",
        photo: "#profileImage",
    },
    parents: ParentSelectors {
        father: "#family-grid [data-relation='father'] a[href*='/memorial/']",
        mother: "#family-grid [data-relation='mother'] a[href*='/memorial/']",
        section: "#family-grid .parents a[href*='/memorial/']",
    },
    spouses: "#family-grid [data-relation='spouse'] a[href*='/memorial/']",
    id_pattern: r"/memorial/(\d+)",
    trees: TreeListing::Shared("Find a Grave memorials"),
};

#[cfg(test)]
mod tests {
    use regex::Regex;

    use super::*;

    #[test]
    fn every_profile_matches_its_provider() {
        for provider in Provider::ALL {
            assert_eq!(profile(provider).provider, provider);
        }
    }

    #[test]
    fn id_patterns_compile_and_capture() {
        for provider in Provider::ALL {
            let p = profile(provider);
            let re = Regex::new(p.id_pattern).unwrap();
            assert_eq!(re.captures_len(), 2, "{provider} pattern needs one group");
        }
    }

    #[test]
    fn person_url_substitutes_id() {
        assert_eq!(
            profile(Provider::FamilySearch).person_url("KWCJ-4XD"),
            "https://www.familysearch.org/tree/person/details/KWCJ-4XD"
        );
        let re = Regex::new(profile(Provider::FamilySearch).id_pattern).unwrap();
        let caps = re
            .captures("https://www.familysearch.org/tree/person/details/KWCJ-4XD")
            .unwrap();
        assert_eq!(&caps[1], "KWCJ-4XD");
    }

    #[test]
    fn family_lives_on_the_person_page() {
        for provider in Provider::ALL {
            assert_eq!(profile(provider).family_url("X-1"), None, "{provider}");
        }
    }

    #[test]
    fn wikitree_ids_keep_surname() {
        let re = Regex::new(profile(Provider::WikiTree).id_pattern).unwrap();
        let caps = re.captures("/wiki/O'Brien-1234").unwrap();
        assert_eq!(&caps[1], "O'Brien-1234");
    }
}
