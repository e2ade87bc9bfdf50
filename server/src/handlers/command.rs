//! `::` commands typed into the chat box.
//!
//! Most commands act on the issuing player immediately. A few schedule work
//! instead: `walkto` waits for the walk to finish, `home` runs a chain of
//! delayed steps, `poison` and `timer` register player-owned tasks that are
//! cancelled when the player logs out.

use super::{HandlerContext, HandlerError};
use crate::scheduler::{BoxedTask, ChainTaskExecutor, Schedule, TaskHandle, TaskResult, TimeUnit};
use crate::world::listener::on_arrival;
use crate::world::{Animation, Graphic, Hit, HitType, Player, Rights, World};
use log::info;
use parking_lot::Mutex;
use shared::{PacketReader, Position};
use std::str::FromStr;
use std::sync::Weak;

const TELEPORT_CAST: Animation = Animation { id: 714, delay: 0 };
const TELEPORT_LAND: Animation = Animation { id: 715, delay: 0 };
const TELEPORT_GRAPHIC: u16 = 308;
/// Ticks between casting the home teleport and arriving.
const HOME_CAST_TICKS: u64 = 3;
const POISON_HITS: u8 = 5;
const POISON_INTERVAL_TICKS: u64 = 4;
const POISON_DAMAGE: u8 = 2;

pub fn handle(ctx: &mut HandlerContext<'_>, reader: &mut PacketReader<'_>) -> Result<(), HandlerError> {
    let line = reader.get_string()?;
    let mut parts = line.split_whitespace();
    let Some(name) = parts.next() else {
        return Ok(());
    };
    let name = name.to_lowercase();
    let args: Vec<&str> = parts.collect();

    match execute(ctx, &name, &args) {
        Err(HandlerError::Invalid(reply)) => {
            ctx.player()?.send_message(&reply)?;
            Ok(())
        }
        other => other,
    }
}

fn execute(ctx: &mut HandlerContext<'_>, name: &str, args: &[&str]) -> Result<(), HandlerError> {
    match name {
        "anim" => {
            let id = arg(args, 0, "::anim <id>")?;
            ctx.player_mut()?.core.play_animation(Animation::new(id));
        }
        "gfx" => {
            let id = arg(args, 0, "::gfx <id>")?;
            ctx.player_mut()?.core.play_graphic(Graphic::high(id));
        }
        "hit" => {
            let damage = arg(args, 0, "::hit <damage>")?;
            ctx.player_mut()?.core.damage(Hit::new(damage));
        }
        "pos" => {
            let player = ctx.player()?;
            player.send_message(&format!("You are at {}.", player.core.position))?;
        }
        "players" => {
            let online = ctx.world.players.len();
            ctx.player()?
                .send_message(&format!("There are {} player(s) online.", online))?;
        }
        "run" => {
            let movement = &mut ctx.player_mut()?.core.movement;
            let running = !movement.is_run_toggled();
            movement.set_running(running);
        }
        "tele" => {
            require_admin(ctx.player()?)?;
            let x = arg(args, 0, "::tele <x> <y> [z]")?;
            let y = arg(args, 1, "::tele <x> <y> [z]")?;
            let z = if args.len() > 2 {
                arg(args, 2, "::tele <x> <y> [z]")?
            } else {
                ctx.player()?.core.position.z
            };
            ctx.player_mut()?.core.teleport(Position::new(x, y, z));
        }
        "walkto" => walk_to(ctx, args)?,
        "home" => home(ctx)?,
        "poison" => poison(ctx)?,
        "timer" => timer(ctx, args)?,
        "restrict" => {
            require_admin(ctx.player()?)?;
            let enabled = match args.first().copied() {
                Some("on") => true,
                Some("off") => false,
                _ => return Err(usage("::restrict <on|off>")),
            };
            ctx.services.gateway.set_restricted(enabled);
            info!("Restricted mode {} by '{}'", args[0], ctx.player()?.username);
            ctx.player()?
                .send_message(&format!("Restricted mode is now {}.", args[0]))?;
        }
        "npc" => {
            require_admin(ctx.player()?)?;
            let kind = arg(args, 0, "::npc <id>")?;
            let position = ctx.player()?.core.position;
            let slot = ctx.world.spawn_mob(kind, position, 10)?;
            ctx.player()?
                .send_message(&format!("Spawned mob {} in slot {}.", kind, slot))?;
        }
        _ => return Err(usage(&format!("Unknown command '{}'.", name))),
    }
    Ok(())
}

fn usage(text: &str) -> HandlerError {
    HandlerError::Invalid(text.to_string())
}

fn arg<T: FromStr>(args: &[&str], index: usize, usage_text: &str) -> Result<T, HandlerError> {
    args.get(index)
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| usage(&format!("Usage: {}", usage_text)))
}

fn require_admin(player: &Player) -> Result<(), HandlerError> {
    if player.rights < Rights::Administrator {
        return Err(usage("You do not have permission to do that."));
    }
    Ok(())
}

/// Wraps a recurring action so it only touches the player that scheduled it.
fn player_task<F>(
    world: Weak<Mutex<World>>,
    slot: usize,
    key: u64,
    mut action: F,
) -> impl FnMut(&TaskHandle) -> TaskResult + Send + 'static
where
    F: FnMut(&mut Player, &TaskHandle) -> TaskResult + Send + 'static,
{
    move |handle: &TaskHandle| -> TaskResult {
        let Some(world) = world.upgrade() else {
            handle.cancel_if_running();
            return Ok(());
        };
        let mut world = world.lock();
        match world.player_mut(slot) {
            Some(player) if player.key == key => action(player, handle),
            _ => {
                handle.cancel_if_running();
                Ok(())
            }
        }
    }
}

/// One-shot variant of [`player_task`] for chain steps.
fn player_step<F>(
    world: Weak<Mutex<World>>,
    slot: usize,
    key: u64,
    action: F,
) -> impl FnOnce() -> TaskResult + Send + 'static
where
    F: FnOnce(&mut Player) -> TaskResult + Send + 'static,
{
    move || -> TaskResult {
        let Some(world) = world.upgrade() else {
            return Ok(());
        };
        let mut world = world.lock();
        match world.player_mut(slot) {
            Some(player) if player.key == key => action(player),
            _ => Ok(()),
        }
    }
}

fn walk_to(ctx: &mut HandlerContext<'_>, args: &[&str]) -> Result<(), HandlerError> {
    let x = arg(args, 0, "::walkto <x> <y>")?;
    let y = arg(args, 1, "::walkto <x> <y>")?;
    let player = ctx.player_mut()?;
    let current = player.core.position;
    let target = Position::new(x, y, current.z);
    player.core.movement.clear();
    player.core.movement.add_step(current, target);

    on_arrival(
        ctx.world,
        ctx.services.world.clone(),
        &ctx.services.scheduler,
        ctx.slot,
        move |world: &mut World, slot: usize| -> TaskResult {
            if let Some(player) = world.player_mut(slot) {
                player.core.face_position(target.translate(0, -1));
                player.send_message("You have arrived.")?;
            }
            Ok(())
        },
    )?;
    Ok(())
}

fn home(ctx: &mut HandlerContext<'_>) -> Result<(), HandlerError> {
    let spawn = ctx.services.config.spawn;
    let world = ctx.services.world.clone();
    let slot = ctx.slot;
    let player = ctx.player_mut()?;
    let key = player.key;
    player.core.movement.clear();
    player.core.play_animation(TELEPORT_CAST);
    player.core.play_graphic(Graphic::high(TELEPORT_GRAPHIC));

    let chain = ChainTaskExecutor::new(format!("home-{}", slot), TimeUnit::Tick);
    chain.append(
        HOME_CAST_TICKS,
        player_step(world.clone(), slot, key, move |player| {
            player.core.teleport(spawn);
            player.core.play_animation(TELEPORT_LAND);
            Ok(())
        }),
    )?;
    chain.append(
        1,
        player_step(world, slot, key, |player| {
            player.send_message("Welcome home.")?;
            Ok(())
        }),
    )?;
    chain.run(&ctx.services.scheduler)?;
    Ok(())
}

fn poison(ctx: &mut HandlerContext<'_>) -> Result<(), HandlerError> {
    let scheduler = ctx.services.scheduler.clone();
    let world = ctx.services.world.clone();
    let slot = ctx.slot;
    let player = ctx.player_mut()?;
    let key = player.key;

    let mut remaining = POISON_HITS;
    let task = player_task(world, slot, key, move |player, handle| {
        player.core.damage(Hit {
            damage: POISON_DAMAGE,
            kind: HitType::Poison,
        });
        remaining -= 1;
        if remaining == 0 || player.core.hitpoints == 0 {
            handle.cancel_if_running();
            player.send_message("The poison wears off.")?;
        }
        Ok(())
    });
    player.tasks.submit(
        &scheduler,
        Schedule::ticks(POISON_INTERVAL_TICKS),
        BoxedTask::new(task),
    )?;
    player.send_message("You have been poisoned!")?;
    Ok(())
}

fn timer(ctx: &mut HandlerContext<'_>, args: &[&str]) -> Result<(), HandlerError> {
    let seconds: u64 = arg(args, 0, "::timer <seconds>")?;
    let scheduler = ctx.services.scheduler.clone();
    let world = ctx.services.world.clone();
    let slot = ctx.slot;
    let player = ctx.player_mut()?;
    let key = player.key;

    let task = player_task(world, slot, key, move |player, _| {
        player.send_message(&format!("{} second timer finished.", seconds))?;
        Ok(())
    });
    player.tasks.submit(
        &scheduler,
        Schedule::once(seconds, TimeUnit::Second),
        BoxedTask::new(task),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::testing::{Fixture, SPAWN};
    use super::*;
    use crate::world::UpdateFlag;
    use shared::packet::client;
    use std::time::Duration;

    fn command(fixture: &Fixture, line: &str) -> Result<(), HandlerError> {
        let mut payload = line.as_bytes().to_vec();
        payload.push(shared::STRING_TERMINATOR);
        fixture.dispatch(client::COMMAND, &payload)
    }

    fn make_admin(fixture: &Fixture) {
        fixture.world.lock().player_mut(fixture.slot).unwrap().rights = Rights::Administrator;
    }

    #[test]
    fn test_anim_and_hit() {
        let fixture = Fixture::new();
        command(&fixture, "anim 866").unwrap();
        command(&fixture, "hit 3").unwrap();
        let world = fixture.world.lock();
        let player = world.player(fixture.slot).unwrap();
        assert_eq!(player.core.animation, Some(Animation::new(866)));
        assert!(player.core.flags.contains(UpdateFlag::Hit));
        assert_eq!(player.core.hitpoints, player.core.max_hitpoints - 3);
    }

    #[test]
    fn test_bad_arguments_reply_instead_of_failing() {
        let fixture = Fixture::new();
        command(&fixture, "anim dance").unwrap();
        command(&fixture, "nonsense").unwrap();
        let world = fixture.world.lock();
        let player = world.player(fixture.slot).unwrap();
        assert!(player.core.animation.is_none());
        assert!(player.session.pending_bytes() > 0);
    }

    #[test]
    fn test_teleport_requires_admin() {
        let fixture = Fixture::new();
        command(&fixture, "tele 3000 3000").unwrap();
        assert_eq!(fixture.world.lock().player(fixture.slot).unwrap().core.position, SPAWN);

        make_admin(&fixture);
        command(&fixture, "tele 3000 3001 1").unwrap();
        let world = fixture.world.lock();
        let player = world.player(fixture.slot).unwrap();
        assert_eq!(player.core.position, Position::new(3000, 3001, 1));
        assert!(player.core.teleported);
    }

    #[test]
    fn test_restrict_toggles_gateway() {
        let fixture = Fixture::new();
        make_admin(&fixture);
        command(&fixture, "restrict on").unwrap();
        assert!(fixture.services.gateway.is_restricted());
        command(&fixture, "restrict off").unwrap();
        assert!(!fixture.services.gateway.is_restricted());
    }

    #[test]
    fn test_poison_registers_player_task() {
        let fixture = Fixture::new();
        command(&fixture, "poison").unwrap();
        let handles = fixture
            .world
            .lock()
            .player(fixture.slot)
            .unwrap()
            .tasks
            .handles();
        assert_eq!(handles.len(), 1);

        fixture.world.lock().unregister_player(fixture.slot);
        assert!(handles[0].is_cancelled());
    }

    #[test]
    fn test_walkto_fires_after_arrival() {
        let fixture = Fixture::new();
        command(&fixture, &format!("walkto {} {}", SPAWN.x + 2, SPAWN.y)).unwrap();
        assert!(fixture
            .world
            .lock()
            .player(fixture.slot)
            .unwrap()
            .movement_listener
            .is_some());

        // Two walk steps; nothing resets the tick state afterwards.
        for _ in 0..2 {
            fixture.world.lock().process_tick();
        }

        let mut arrived = false;
        for _ in 0..50 {
            std::thread::sleep(Duration::from_millis(20));
            let world = fixture.world.lock();
            let player = world.player(fixture.slot).unwrap();
            if player.core.face_position.is_some() {
                arrived = true;
                break;
            }
        }
        assert!(arrived);
        let world = fixture.world.lock();
        let player = world.player(fixture.slot).unwrap();
        assert_eq!(player.core.position, Position::new(SPAWN.x + 2, SPAWN.y, 0));
    }
}
