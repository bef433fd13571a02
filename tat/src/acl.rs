// Copyright 2023 Xayn AG
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Converts `aclitem` entries back into `grant` statements.
//!
//! Dropping a view or function discards its acl, so the acl captured at
//! introspection time has to be replayed after the object is recreated.

use anyhow::bail;

use crate::{ddl::quote_ident, introspect::AclParams, Error};

/// One statement per privilege group of each `grantee=privs/grantor` entry.
pub(crate) fn acl_to_grants(params: &AclParams) -> Result<Vec<String>, Error> {
    let mut grants = Vec::new();
    for item in &params.acl {
        grants.extend(grants_for_item(item, &params.obj_type, &params.obj_name)?);
    }
    Ok(grants)
}

fn grants_for_item(item: &str, obj_type: &str, obj_name: &str) -> Result<Vec<String>, Error> {
    let Some((grantee, rest)) = item.split_once('=') else {
        bail!("malformed aclitem {item:?}");
    };
    let Some((privileges, _grantor)) = rest.split_once('/') else {
        bail!("malformed aclitem {item:?}");
    };

    let mut plain = Vec::new();
    let mut with_grant_option = Vec::new();
    let mut letters = privileges.chars().peekable();
    while let Some(letter) = letters.next() {
        let privilege = privilege_name(letter, item)?;
        if letters.next_if_eq(&'*').is_some() {
            with_grant_option.push(privilege);
        } else {
            plain.push(privilege);
        }
    }

    let grantee = render_grantee(grantee);
    let mut grants = Vec::new();
    if !plain.is_empty() {
        grants.push(format!(
            "grant {} on {obj_type} {obj_name} to {grantee};",
            plain.join(", "),
        ));
    }
    if !with_grant_option.is_empty() {
        grants.push(format!(
            "grant {} on {obj_type} {obj_name} to {grantee} with grant option;",
            with_grant_option.join(", "),
        ));
    }
    Ok(grants)
}

fn privilege_name(letter: char, item: &str) -> Result<&'static str, Error> {
    Ok(match letter {
        'a' => "insert",
        'r' => "select",
        'w' => "update",
        'd' => "delete",
        'D' => "truncate",
        'x' => "references",
        't' => "trigger",
        'X' => "execute",
        'U' => "usage",
        'C' => "create",
        'c' => "connect",
        'T' => "temporary",
        _ => bail!("unknown privilege {letter:?} in aclitem {item:?}"),
    })
}

fn render_grantee(grantee: &str) -> String {
    if grantee.is_empty() {
        // an empty grantee is the PUBLIC pseudo role
        "public".into()
    } else if grantee.starts_with('"') {
        // aclitem output already quotes names which need it
        grantee.into()
    } else {
        quote_ident(grantee)
    }
}
