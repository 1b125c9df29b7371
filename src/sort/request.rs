use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use typed_builder::TypedBuilder;

use crate::net::{CorrelationId, Error};

/// Which posts a sort ranks. The inbox types are scoped to the local client
/// site or to every site; `Stream` sorts a public stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortType {
    LocalPrivate,
    GlobalPrivate,
    LocalPublic,
    GlobalPublic,
    LocalAll,
    GlobalAll,
    LocalSentPrivate,
    GlobalSentPrivate,
    Stream,
}

impl SortType {
    pub const ALL: [SortType; 9] = [
        SortType::LocalPrivate,
        SortType::GlobalPrivate,
        SortType::LocalPublic,
        SortType::GlobalPublic,
        SortType::LocalAll,
        SortType::GlobalAll,
        SortType::LocalSentPrivate,
        SortType::GlobalSentPrivate,
        SortType::Stream,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SortType::LocalPrivate => "local_private",
            SortType::GlobalPrivate => "global_private",
            SortType::LocalPublic => "local_public",
            SortType::GlobalPublic => "global_public",
            SortType::LocalAll => "local_all",
            SortType::GlobalAll => "global_all",
            SortType::LocalSentPrivate => "local_sent_private",
            SortType::GlobalSentPrivate => "global_sent_private",
            SortType::Stream => "stream",
        }
    }

    /// Public streams span every site.
    pub fn locality(&self) -> Locality {
        match self {
            SortType::LocalPrivate
            | SortType::LocalPublic
            | SortType::LocalAll
            | SortType::LocalSentPrivate => Locality::Local,
            _ => Locality::Global,
        }
    }
}

impl fmt::Display for SortType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown sort type `{s}`"))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Locality {
    /// Posts on this client site.
    Local,
    /// Posts from every site.
    Global,
}

/// The rhythm that ranks the posts and how urgently it should run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterDescriptor {
    pub url: String,
    pub name: String,
    pub priority: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub username: String,
    pub domain: String,
}

/// One ranking query for a page of posts.
#[derive(Clone, Debug, PartialEq, TypedBuilder)]
pub struct SortRequest {
    pub sort_type: SortType,
    pub filter: FilterDescriptor,
    /// 1-based. Values below 1 are never sent.
    pub page: i64,
    pub user: UserIdentity,
    /// Addresses of the moderation rings whose exclusions apply.
    #[builder(default)]
    pub moderation_rings: Vec<String>,
    /// Only rank posts older than this unix timestamp.
    #[builder(default)]
    pub posts_to_timestamp: Option<i64>,
}

#[derive(Serialize)]
struct SortPayload<'a> {
    #[serde(rename = "type")]
    sort_type: SortType,
    client_uid: &'a CorrelationId,
    filter: &'a FilterDescriptor,
    moderation_rings: &'a [String],
    posts_to_timestamp: Option<i64>,
    private_page: i64,
    user: &'a UserIdentity,
}

impl SortRequest {
    /// The action name the domus dispatches on.
    pub const KIND: &'static str = "SortRequest";

    /// The wire payload, with `client_uid` set to the request's correlation
    /// id.
    pub fn payload(&self, client_uid: &CorrelationId) -> Result<Value, Error> {
        Ok(serde_json::to_value(SortPayload {
            sort_type: self.sort_type,
            client_uid,
            filter: &self.filter,
            moderation_rings: &self.moderation_rings,
            posts_to_timestamp: self.posts_to_timestamp,
            private_page: self.page,
            user: &self.user,
        })?)
    }
}
