//! Typed calls to the `org.freedesktop.DBus` interface of the daemon.

use tracing::debug;

use super::Connection;
use crate::bus::{ReleaseNameReply, RequestNameReply, BUS_INTERFACE, BUS_NAME, BUS_PATH};
use crate::error::{BusError, BusResult};
use crate::match_rule::MatchRule;
use crate::wire::{Message, Value};

impl Connection {
    async fn bus_call(&self, member: &str, body: Vec<Value>) -> BusResult<Vec<Value>> {
        let call = Message::method_call(BUS_PATH, member)?
            .with_interface(BUS_INTERFACE)
            .with_destination(BUS_NAME)
            .with_body(body)?;
        let reply = self.call(call).await?;
        Ok(reply.into_body())
    }

    /// Registers with the bus and records the unique name it assigns.
    ///
    /// Must be the first call on a bus connection; calling it twice is
    /// refused by the daemon.
    pub async fn hello(&self) -> BusResult<String> {
        let name = string_reply("Hello", self.bus_call("Hello", Vec::new()).await?)?;
        if self.inner.unique_name.set(name.clone()).is_err() {
            debug!(%name, "unique name already recorded");
        }
        debug!(unique_name = %name, "registered with bus");
        Ok(name)
    }

    /// Asks the bus for ownership of `name`.
    pub async fn request_name(&self, name: &str, flags: u32) -> BusResult<RequestNameReply> {
        let body = self
            .bus_call("RequestName", vec![name.into(), flags.into()])
            .await?;
        let code = u32_reply("RequestName", body)?;
        RequestNameReply::from_u32(code)
            .ok_or_else(|| BusError::invalid_message(format!("unknown RequestName reply {code}")))
    }

    /// Gives up ownership of `name`.
    pub async fn release_name(&self, name: &str) -> BusResult<ReleaseNameReply> {
        let body = self.bus_call("ReleaseName", vec![name.into()]).await?;
        let code = u32_reply("ReleaseName", body)?;
        ReleaseNameReply::from_u32(code)
            .ok_or_else(|| BusError::invalid_message(format!("unknown ReleaseName reply {code}")))
    }

    /// Every name currently owned on the bus, including the bus itself.
    pub async fn list_names(&self) -> BusResult<Vec<String>> {
        let body = self.bus_call("ListNames", Vec::new()).await?;
        string_array_reply("ListNames", body)
    }

    /// Connections queued for `name`, owner first.
    pub async fn list_queued_owners(&self, name: &str) -> BusResult<Vec<String>> {
        let body = self
            .bus_call("ListQueuedOwners", vec![name.into()])
            .await?;
        string_array_reply("ListQueuedOwners", body)
    }

    /// Whether `name` currently has an owner.
    pub async fn name_has_owner(&self, name: &str) -> BusResult<bool> {
        let body = self.bus_call("NameHasOwner", vec![name.into()]).await?;
        first("NameHasOwner", &body)?
            .as_bool()
            .ok_or_else(|| unexpected("NameHasOwner", &body))
    }

    /// Unique name of the owner of `name`.
    pub async fn get_name_owner(&self, name: &str) -> BusResult<String> {
        let body = self.bus_call("GetNameOwner", vec![name.into()]).await?;
        string_reply("GetNameOwner", body)
    }

    /// Unix uid of the connection owning `name`.
    pub async fn get_connection_unix_user(&self, name: &str) -> BusResult<u32> {
        let body = self
            .bus_call("GetConnectionUnixUser", vec![name.into()])
            .await?;
        u32_reply("GetConnectionUnixUser", body)
    }

    /// Process id of the connection owning `name`.
    pub async fn get_connection_unix_process_id(&self, name: &str) -> BusResult<u32> {
        let body = self
            .bus_call("GetConnectionUnixProcessID", vec![name.into()])
            .await?;
        u32_reply("GetConnectionUnixProcessID", body)
    }

    /// Guid of the bus.
    pub async fn get_id(&self) -> BusResult<String> {
        let body = self.bus_call("GetId", Vec::new()).await?;
        string_reply("GetId", body)
    }

    /// Asks the bus to route messages matching `rule` to this connection.
    pub async fn add_match_rule(&self, rule: &MatchRule) -> BusResult<()> {
        self.bus_call("AddMatch", vec![rule.to_string().into()])
            .await?;
        Ok(())
    }

    /// Withdraws a rule added with [`Connection::add_match_rule`].
    pub async fn remove_match_rule(&self, rule: &MatchRule) -> BusResult<()> {
        self.bus_call("RemoveMatch", vec![rule.to_string().into()])
            .await?;
        Ok(())
    }
}

fn unexpected(member: &str, body: &[Value]) -> BusError {
    BusError::invalid_message(format!("unexpected {member} reply: {body:?}"))
}

fn first<'a>(member: &str, body: &'a [Value]) -> BusResult<&'a Value> {
    body.first().ok_or_else(|| unexpected(member, body))
}

fn string_reply(member: &str, body: Vec<Value>) -> BusResult<String> {
    match body.into_iter().next() {
        Some(Value::String(value)) => Ok(value),
        other => Err(BusError::invalid_message(format!(
            "unexpected {member} reply: {other:?}"
        ))),
    }
}

fn u32_reply(member: &str, body: Vec<Value>) -> BusResult<u32> {
    first(member, &body)?
        .as_u32()
        .ok_or_else(|| unexpected(member, &body))
}

fn string_array_reply(member: &str, body: Vec<Value>) -> BusResult<Vec<String>> {
    let items = first(member, &body)?
        .as_array()
        .ok_or_else(|| unexpected(member, &body))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| unexpected(member, &body))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_extraction() {
        assert_eq!(
            string_reply("Hello", vec![":1.4".into()]).unwrap(),
            ":1.4"
        );
        assert!(string_reply("Hello", vec![7u32.into()]).is_err());
        assert_eq!(u32_reply("RequestName", vec![1u32.into()]).unwrap(), 1);
        assert!(u32_reply("RequestName", Vec::new()).is_err());
        assert_eq!(
            string_array_reply("ListNames", vec![Value::string_array(["a.b", ":1.1"])]).unwrap(),
            vec!["a.b".to_string(), ":1.1".to_string()]
        );
    }
}
