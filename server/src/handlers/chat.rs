use super::{HandlerContext, HandlerError};
use crate::world::ChatMessage;
use shared::{PacketReader, ValueType};

/// Longest packed chat text the client produces.
const MAX_CHAT_BYTES: usize = 80;

/// Public chat. The text stays in the client's packed form and is echoed
/// back to observers through the chat update block.
pub fn handle(ctx: &mut HandlerContext<'_>, reader: &mut PacketReader<'_>) -> Result<(), HandlerError> {
    let effects = reader.get_u8(ValueType::S)?;
    let color = reader.get_u8(ValueType::S)?;
    let length = reader.remaining();
    if length == 0 || length > MAX_CHAT_BYTES {
        return Err(HandlerError::Invalid(format!("chat text of {} bytes", length)));
    }
    let text = reader.get_bytes_reverse(length, ValueType::A)?;
    ctx.player_mut()?.set_chat(ChatMessage {
        color,
        effects,
        text,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::testing::Fixture;
    use super::*;
    use crate::world::UpdateFlag;
    use shared::packet::client;
    use shared::PacketBuffer;

    #[test]
    fn test_chat_sets_flag_and_text() {
        let fixture = Fixture::new();
        let mut payload = PacketBuffer::new();
        payload
            .put_u8(2, ValueType::S)
            .put_u8(9, ValueType::S)
            .put_bytes_reverse(&[0x10, 0x20, 0x30], ValueType::A);
        fixture.dispatch(client::CHAT, payload.as_slice()).unwrap();

        let world = fixture.world.lock();
        let player = world.player(fixture.slot).unwrap();
        assert!(player.core.flags.contains(UpdateFlag::Chat));
        assert_eq!(
            player.chat,
            Some(ChatMessage {
                color: 9,
                effects: 2,
                text: vec![0x10, 0x20, 0x30],
            })
        );
    }

    #[test]
    fn test_empty_chat_rejected() {
        let fixture = Fixture::new();
        assert!(matches!(
            fixture.dispatch(client::CHAT, &[0, 0]),
            Err(HandlerError::Invalid(_))
        ));
        let world = fixture.world.lock();
        assert!(world.player(fixture.slot).unwrap().chat.is_none());
    }
}
