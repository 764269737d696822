// Copyright 2023 The SeamDB Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use etcd_client::{Client, ConnectOptions, GetResponse, TxnOpResponse, TxnResponse};
use uriparse::{Authority, Query, Scheme, SchemeError, Segment};

/// Minimal lease etcd grants.
pub const MIN_LEASE_TTL: Duration = Duration::from_secs(1);

/// Parsed `etcd://host1:2379,host2:2379/root?username=u&password=p` uri.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EtcdUri {
    pub endpoints: Vec<String>,
    pub root: String,
    pub user: Option<(String, String)>,
}

fn is_valid_root(path: &str) -> bool {
    if path.is_empty() {
        return true;
    } else if path.ends_with('/') || !path.starts_with('/') {
        return false;
    }
    path[1..].split('/').all(|segment| !segment.is_empty() && Segment::try_from(segment).is_ok())
}

fn parse_user(query: &str) -> Option<Option<(String, String)>> {
    if Query::try_from(query).is_err() {
        return None;
    }
    let (mut username, mut password) = (None, None);
    for param in query.split('&') {
        let (key, value) = param.split_once('=')?;
        let slot = match key {
            "username" => &mut username,
            "password" => &mut password,
            _ => return None,
        };
        if slot.replace(value.to_string()).is_some() {
            return None;
        }
    }
    match (username, password) {
        (None, None) => Some(None),
        (Some(username), Some(password)) => Some(Some((username, password))),
        _ => None,
    }
}

impl EtcdUri {
    pub fn parse(uri: &str) -> Result<Self> {
        let Some((scheme, trailing)) = uri.split_once("://") else {
            bail!("invalid etcd uri: {uri}")
        };
        match Scheme::try_from(scheme) {
            Err(SchemeError::Empty) => bail!("no scheme in etcd uri: {uri}"),
            Err(_) => bail!("invalid scheme in etcd uri: {uri}"),
            Ok(_) => {},
        };
        let scheme = match scheme {
            "etcd" => "http",
            "etcd+tls" => "https",
            _ => bail!("unsupported etcd uri scheme: {uri}"),
        };

        let (address, trailing) = match trailing.find(['/', '?']) {
            None => (trailing, ""),
            Some(i) => (&trailing[..i], &trailing[i..]),
        };
        if address.is_empty() {
            bail!("no address in etcd uri: {uri}")
        }
        let mut endpoints = Vec::new();
        for server in address.split(',') {
            let Ok(authority) = Authority::try_from(server) else {
                bail!("invalid address in etcd uri: {uri}")
            };
            if authority.has_username() {
                bail!("unsupported username in etcd uri address: {uri}")
            }
            endpoints.push(format!("{scheme}://{server}"));
        }

        let (root, user) = match trailing.split_once('?') {
            None => (trailing, None),
            Some((_, "")) => bail!("empty params in etcd uri: {uri}"),
            Some((root, query)) => {
                let Some(user) = parse_user(query) else {
                    bail!("invalid params in etcd uri: {uri}")
                };
                (root, user)
            },
        };
        if !is_valid_root(root) {
            bail!("invalid root path in etcd uri: {uri}")
        }
        Ok(Self { endpoints, root: root.to_string(), user })
    }
}

pub enum EtcdHelper {}

impl EtcdHelper {
    pub async fn connect(uri: &EtcdUri) -> Result<Client> {
        let mut options = ConnectOptions::default().with_connect_timeout(Duration::from_secs(5));
        if let Some((username, password)) = &uri.user {
            options = options.with_user(username.as_str(), password.as_str());
        }
        Ok(Client::connect(&uri.endpoints, Some(options)).await?)
    }

    /// Grants a lease without keep alive, it expires after ttl unless granted again.
    pub async fn grant_lease(client: &mut Client, ttl: Duration) -> Result<i64> {
        let ttl = ttl.max(MIN_LEASE_TTL);
        let response = client.lease_grant(ttl.as_secs() as i64, None).await?;
        Ok(response.id())
    }

    /// Renews lease once. Returns `false` if it has expired.
    pub async fn renew_lease(client: &mut Client, lease_id: i64) -> Result<bool> {
        let (mut keeper, mut responses) = client.lease_keep_alive(lease_id).await?;
        keeper.keep_alive().await?;
        match responses.message().await? {
            Some(response) => Ok(response.ttl() > 0),
            None => Ok(false),
        }
    }

    pub fn into_gets(response: TxnResponse) -> Result<Vec<GetResponse>> {
        response
            .op_responses()
            .into_iter()
            .map(|op| match op {
                TxnOpResponse::Get(get) => Ok(get),
                _ => Err(anyhow!("expect get response in etcd txn")),
            })
            .collect()
    }
}
