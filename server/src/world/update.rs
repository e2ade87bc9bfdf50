//! Per-observer player and mob synchronization packets
//!
//! Each packet starts with a bit-packed section describing movement, removals
//! and additions, followed by the byte-aligned update blocks of every entity
//! that was flagged. Blocks appear in the same order as the bit section
//! refers to their entities.

use super::entity::{EntityCore, UpdateFlag};
use super::mob::Mob;
use super::player::{Gender, LocalEntity, Player};
use super::World;
use shared::packet::server;
use shared::{name_to_long, BitWriter, ByteOrder, OutgoingPacket, PacketBuffer, Position, ValueType};

/// Largest local list the count field can express.
pub const MAX_LOCAL_ENTITIES: usize = 255;
/// Newly visible entities added per observer per tick.
pub const ADDITIONS_PER_TICK: usize = 15;

/// Eleven-bit slot index that ends the player addition list.
pub(crate) const PLAYER_TERMINATOR: u32 = 2047;
const MOB_TERMINATOR: u32 = 16383;

/// Stand, turn, walk, turn-around, turn-clockwise, turn-counterclockwise and
/// run animations.
const MOVEMENT_ANIMATIONS: [u16; 7] = [808, 823, 819, 820, 821, 822, 824];

mod player_mask {
    pub const FACE_ENTITY: u16 = 0x1;
    pub const FACE_COORDINATE: u16 = 0x2;
    pub const FORCED_CHAT: u16 = 0x4;
    pub const ANIMATION: u16 = 0x8;
    pub const APPEARANCE: u16 = 0x10;
    pub const HIT: u16 = 0x20;
    pub const EXTENDED: u16 = 0x40;
    pub const CHAT: u16 = 0x80;
    pub const GRAPHIC: u16 = 0x100;
    pub const HIT2: u16 = 0x200;
}

mod mob_mask {
    pub const FORCED_CHAT: u8 = 0x1;
    pub const TRANSFORM: u8 = 0x2;
    pub const FACE_COORDINATE: u8 = 0x4;
    pub const HIT: u8 = 0x8;
    pub const ANIMATION: u8 = 0x10;
    pub const FACE_ENTITY: u8 = 0x20;
    pub const HIT2: u8 = 0x40;
    pub const GRAPHIC: u8 = 0x80;
}

/// Builds the player update for the observer in `slot`. `local` is the
/// observer's local player list, taken out of the player for the duration.
pub fn player_update(world: &World, slot: usize, local: &mut Vec<LocalEntity>) -> Option<OutgoingPacket> {
    let observer = world.players.get(slot)?;
    let mut packet = PacketBuffer::with_capacity(256);
    let mut blocks = PacketBuffer::new();
    {
        let mut bits = packet.bit_access();

        let own_mask = player_block_mask(observer, false, false);
        if observer.needs_placement() {
            let base = observer.region_base.unwrap_or(observer.core.position);
            let position = observer.core.position;
            bits.put(1, 1)
                .put(2, 3)
                .put(2, position.z as u32)
                .put_flag(observer.core.teleported)
                .put_flag(own_mask != 0)
                .put(7, position.local_y(&base) as u32)
                .put(7, position.local_x(&base) as u32);
        } else {
            write_movement(&mut bits, &observer.core, own_mask != 0);
        }
        if own_mask != 0 {
            write_player_block(&mut blocks, observer, own_mask);
        }

        bits.put(8, local.len() as u32);
        local.retain(|entry| {
            let visible = world.players.get(entry.slot).filter(|other| {
                other.key == entry.key
                    && !other.needs_placement()
                    && other.core.position.is_viewable_from(&observer.core.position)
            });
            match visible {
                Some(other) => {
                    let mask = player_block_mask(other, false, true);
                    write_movement(&mut bits, &other.core, mask != 0);
                    if mask != 0 {
                        write_player_block(&mut blocks, other, mask);
                    }
                    true
                }
                None => {
                    bits.put(1, 1).put(2, 3);
                    false
                }
            }
        });

        let mut added = 0;
        for (other_slot, other) in world.players.iter() {
            if local.len() >= MAX_LOCAL_ENTITIES || added >= ADDITIONS_PER_TICK {
                break;
            }
            if other_slot == slot
                || local.iter().any(|entry| entry.slot == other_slot)
                || !other.core.position.is_viewable_from(&observer.core.position)
            {
                continue;
            }
            let (dx, dy) = observer.core.position.delta(&other.core.position);
            bits.put(11, other_slot as u32)
                .put_flag(true)
                .put_flag(true)
                .put_signed(5, dy)
                .put_signed(5, dx);
            let mask = player_block_mask(other, true, true);
            write_player_block(&mut blocks, other, mask);
            local.push(LocalEntity {
                slot: other_slot,
                key: other.key,
            });
            added += 1;
        }

        if !blocks.is_empty() {
            bits.put(11, PLAYER_TERMINATOR);
        }
    }
    packet.put_bytes(blocks.as_slice());
    Some(OutgoingPacket::server(server::PLAYER_UPDATE, packet))
}

/// Builds the mob update for the observer in `slot`.
pub fn mob_update(world: &World, slot: usize, local: &mut Vec<LocalEntity>) -> Option<OutgoingPacket> {
    let observer = world.players.get(slot)?;
    let origin = observer.core.position;
    let mut packet = PacketBuffer::with_capacity(64);
    let mut blocks = PacketBuffer::new();
    {
        let mut bits = packet.bit_access();
        bits.put(8, local.len() as u32);
        local.retain(|entry| {
            let visible = world.mobs.get(entry.slot).filter(|mob| {
                mob.key == entry.key
                    && !mob.core.teleported
                    && mob.core.position.is_viewable_from(&origin)
            });
            match visible {
                Some(mob) => {
                    let mask = mob_block_mask(mob);
                    write_movement(&mut bits, &mob.core, mask != 0);
                    if mask != 0 {
                        write_mob_block(&mut blocks, mob, mask);
                    }
                    true
                }
                None => {
                    bits.put(1, 1).put(2, 3);
                    false
                }
            }
        });

        let mut added = 0;
        for (mob_slot, mob) in world.mobs.iter() {
            if local.len() >= MAX_LOCAL_ENTITIES || added >= ADDITIONS_PER_TICK {
                break;
            }
            if local.iter().any(|entry| entry.slot == mob_slot)
                || !mob.core.position.is_viewable_from(&origin)
            {
                continue;
            }
            let (dx, dy) = origin.delta(&mob.core.position);
            let mask = mob_block_mask(mob);
            bits.put(14, mob_slot as u32)
                .put_signed(5, dy)
                .put_signed(5, dx)
                .put_flag(false)
                .put(12, mob.kind as u32)
                .put_flag(mask != 0);
            if mask != 0 {
                write_mob_block(&mut blocks, mob, mask);
            }
            local.push(LocalEntity {
                slot: mob_slot,
                key: mob.key,
            });
            added += 1;
        }

        if !blocks.is_empty() {
            bits.put(14, MOB_TERMINATOR);
        }
    }
    packet.put_bytes(blocks.as_slice());
    Some(OutgoingPacket::server(server::MOB_UPDATE, packet))
}

/// Walk/run/idle encoding shared by local players and mobs.
fn write_movement(bits: &mut BitWriter<'_>, core: &EntityCore, update_required: bool) {
    match (core.walk_direction, core.run_direction) {
        (None, _) => {
            if update_required {
                bits.put(1, 1).put(2, 0);
            } else {
                bits.put(1, 0);
            }
        }
        (Some(walk), None) => {
            bits.put(1, 1)
                .put(2, 1)
                .put(3, walk.id())
                .put_flag(update_required);
        }
        (Some(walk), Some(run)) => {
            bits.put(1, 1)
                .put(2, 2)
                .put(3, walk.id())
                .put(3, run.id())
                .put_flag(update_required);
        }
    }
}

fn player_block_mask(player: &Player, force_appearance: bool, include_chat: bool) -> u16 {
    let flags = &player.core.flags;
    let mut mask = 0;
    if flags.contains(UpdateFlag::Graphic) && player.core.graphic.is_some() {
        mask |= player_mask::GRAPHIC;
    }
    if flags.contains(UpdateFlag::Animation) && player.core.animation.is_some() {
        mask |= player_mask::ANIMATION;
    }
    if flags.contains(UpdateFlag::ForcedChat) && player.core.forced_chat.is_some() {
        mask |= player_mask::FORCED_CHAT;
    }
    if include_chat && flags.contains(UpdateFlag::Chat) && player.chat.is_some() {
        mask |= player_mask::CHAT;
    }
    if flags.contains(UpdateFlag::FaceEntity) && player.core.face_entity.is_some() {
        mask |= player_mask::FACE_ENTITY;
    }
    if force_appearance || flags.contains(UpdateFlag::Appearance) {
        mask |= player_mask::APPEARANCE;
    }
    if flags.contains(UpdateFlag::FaceCoordinate) && player.core.face_position.is_some() {
        mask |= player_mask::FACE_COORDINATE;
    }
    if flags.contains(UpdateFlag::Hit) && player.core.primary_hit.is_some() {
        mask |= player_mask::HIT;
    }
    if flags.contains(UpdateFlag::Hit2) && player.core.secondary_hit.is_some() {
        mask |= player_mask::HIT2;
    }
    mask
}

fn write_player_block(out: &mut PacketBuffer, player: &Player, mask: u16) {
    if mask >= 0x100 {
        out.put_u16(mask | player_mask::EXTENDED, ValueType::Standard, ByteOrder::Little);
    } else {
        out.put_u8(mask as u8, ValueType::Standard);
    }

    let core = &player.core;
    if mask & player_mask::GRAPHIC != 0 {
        if let Some(graphic) = core.graphic {
            out.put_u16(graphic.id, ValueType::Standard, ByteOrder::Little).put_u32(
                (graphic.height as u32) << 16 | graphic.delay as u32,
                ValueType::Standard,
                ByteOrder::Big,
            );
        }
    }
    if mask & player_mask::ANIMATION != 0 {
        if let Some(animation) = core.animation {
            out.put_u16(animation.id, ValueType::Standard, ByteOrder::Little)
                .put_u8(animation.delay, ValueType::C);
        }
    }
    if mask & player_mask::FORCED_CHAT != 0 {
        if let Some(text) = &core.forced_chat {
            out.put_string(text);
        }
    }
    if mask & player_mask::CHAT != 0 {
        if let Some(chat) = &player.chat {
            out.put_u16(
                (chat.color as u16) << 8 | chat.effects as u16,
                ValueType::Standard,
                ByteOrder::Little,
            )
            .put_u8(player.rights as u8, ValueType::Standard)
            .put_u8(chat.text.len() as u8, ValueType::C)
            .put_bytes_reverse(&chat.text, ValueType::Standard);
        }
    }
    if mask & player_mask::FACE_ENTITY != 0 {
        if let Some(index) = core.face_entity {
            out.put_u16(index, ValueType::Standard, ByteOrder::Little);
        }
    }
    if mask & player_mask::APPEARANCE != 0 {
        let appearance = appearance_block(player);
        out.put_u8(appearance.len() as u8, ValueType::C)
            .put_bytes(appearance.as_slice());
    }
    if mask & player_mask::FACE_COORDINATE != 0 {
        if let Some(position) = core.face_position {
            let (x, y) = face_coordinates(&position);
            out.put_u16(x, ValueType::A, ByteOrder::Little)
                .put_u16(y, ValueType::Standard, ByteOrder::Little);
        }
    }
    if mask & player_mask::HIT != 0 {
        if let Some(hit) = core.primary_hit {
            out.put_u8(hit.damage, ValueType::Standard)
                .put_u8(hit.kind as u8, ValueType::A)
                .put_u8(core.hitpoints, ValueType::C)
                .put_u8(core.max_hitpoints, ValueType::Standard);
        }
    }
    if mask & player_mask::HIT2 != 0 {
        if let Some(hit) = core.secondary_hit {
            out.put_u8(hit.damage, ValueType::Standard)
                .put_u8(hit.kind as u8, ValueType::S)
                .put_u8(core.hitpoints, ValueType::Standard)
                .put_u8(core.max_hitpoints, ValueType::C);
        }
    }
}

fn appearance_block(player: &Player) -> PacketBuffer {
    let appearance = &player.appearance;
    let body = |index: usize| 0x100 + appearance.body[index];
    let mut props = PacketBuffer::with_capacity(64);
    props
        .put_u8(appearance.gender as u8, ValueType::Standard)
        .put_u8(0, ValueType::Standard);

    // Hat, cape, amulet and weapon slots are empty.
    for _ in 0..4 {
        props.put_u8(0, ValueType::Standard);
    }
    props.put_u16(body(2), ValueType::Standard, ByteOrder::Big);
    props.put_u8(0, ValueType::Standard);
    for part in [3, 5, 0, 4, 6] {
        props.put_u16(body(part), ValueType::Standard, ByteOrder::Big);
    }
    match appearance.gender {
        Gender::Male => props.put_u16(body(1), ValueType::Standard, ByteOrder::Big),
        Gender::Female => props.put_u8(0, ValueType::Standard),
    };

    for color in appearance.colors {
        props.put_u8(color, ValueType::Standard);
    }
    for animation in MOVEMENT_ANIMATIONS {
        props.put_u16(animation, ValueType::Standard, ByteOrder::Big);
    }
    props
        .put_u64(name_to_long(&player.username), ValueType::Standard, ByteOrder::Big)
        .put_u8(player.combat_level, ValueType::Standard)
        .put_u16(0, ValueType::Standard, ByteOrder::Big);
    props
}

fn face_coordinates(position: &Position) -> (u16, u16) {
    ((position.x * 2 + 1) as u16, (position.y * 2 + 1) as u16)
}

fn mob_block_mask(mob: &Mob) -> u8 {
    let core = &mob.core;
    let flags = &core.flags;
    let mut mask = 0;
    if flags.contains(UpdateFlag::Animation) && core.animation.is_some() {
        mask |= mob_mask::ANIMATION;
    }
    if flags.contains(UpdateFlag::Hit) && core.primary_hit.is_some() {
        mask |= mob_mask::HIT;
    }
    if flags.contains(UpdateFlag::Graphic) && core.graphic.is_some() {
        mask |= mob_mask::GRAPHIC;
    }
    if flags.contains(UpdateFlag::FaceEntity) && core.face_entity.is_some() {
        mask |= mob_mask::FACE_ENTITY;
    }
    if flags.contains(UpdateFlag::ForcedChat) && core.forced_chat.is_some() {
        mask |= mob_mask::FORCED_CHAT;
    }
    if flags.contains(UpdateFlag::Hit2) && core.secondary_hit.is_some() {
        mask |= mob_mask::HIT2;
    }
    if flags.contains(UpdateFlag::Transform) && mob.transform.is_some() {
        mask |= mob_mask::TRANSFORM;
    }
    if flags.contains(UpdateFlag::FaceCoordinate) && core.face_position.is_some() {
        mask |= mob_mask::FACE_COORDINATE;
    }
    mask
}

fn write_mob_block(out: &mut PacketBuffer, mob: &Mob, mask: u8) {
    out.put_u8(mask, ValueType::Standard);
    let core = &mob.core;
    if let (true, Some(animation)) = (mask & mob_mask::ANIMATION != 0, core.animation) {
        out.put_u16(animation.id, ValueType::Standard, ByteOrder::Little)
            .put_u8(animation.delay, ValueType::Standard);
    }
    if let (true, Some(hit)) = (mask & mob_mask::HIT != 0, core.primary_hit) {
        out.put_u8(hit.damage, ValueType::C)
            .put_u8(hit.kind as u8, ValueType::S)
            .put_u8(core.hitpoints, ValueType::S)
            .put_u8(core.max_hitpoints, ValueType::Standard);
    }
    if let (true, Some(graphic)) = (mask & mob_mask::GRAPHIC != 0, core.graphic) {
        out.put_u16(graphic.id, ValueType::Standard, ByteOrder::Big).put_u32(
            (graphic.height as u32) << 16 | graphic.delay as u32,
            ValueType::Standard,
            ByteOrder::Big,
        );
    }
    if let (true, Some(index)) = (mask & mob_mask::FACE_ENTITY != 0, core.face_entity) {
        out.put_u16(index, ValueType::Standard, ByteOrder::Big);
    }
    if let (true, Some(text)) = (mask & mob_mask::FORCED_CHAT != 0, &core.forced_chat) {
        out.put_string(text);
    }
    if let (true, Some(hit)) = (mask & mob_mask::HIT2 != 0, core.secondary_hit) {
        out.put_u8(hit.damage, ValueType::A)
            .put_u8(hit.kind as u8, ValueType::C)
            .put_u8(core.hitpoints, ValueType::A)
            .put_u8(core.max_hitpoints, ValueType::Standard);
    }
    if let (true, Some(kind)) = (mask & mob_mask::TRANSFORM != 0, mob.transform) {
        out.put_u16(kind, ValueType::A, ByteOrder::Little);
    }
    if let (true, Some(position)) = (mask & mob_mask::FACE_COORDINATE != 0, core.face_position) {
        let (x, y) = face_coordinates(&position);
        out.put_u16(x, ValueType::Standard, ByteOrder::Little)
            .put_u16(y, ValueType::Standard, ByteOrder::Little);
    }
}
