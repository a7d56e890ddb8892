//! The game orchestrator.
//!
//! A single-writer actor: chat events, admin commands, bet notifications, and
//! timer ticks are serialized through one input queue, and this task is the
//! only writer of [`GameState`]. Ledger RPCs and exports are the only points
//! where it suspends; inputs arriving meanwhile queue up and are seen after
//! the transition completes, where the phase check discards anything stale.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::chat::ChatEvent;
use crate::events::{
    BettingUpdatePayload, GameResetPayload, PhaseChangePayload, ServerEvent, TimerPayload,
    UpdatePayload,
};
use crate::export::ResultExporter;
use crate::hub::Hub;
use crate::interpreter::{Effect, Interpreter};
use crate::ledger::LedgerClient;
use crate::settlement;
use crate::state::{BetSummary, GameSnapshot, GameState, Phase};

const TICK_INTERVAL: Duration = Duration::from_millis(100);
const INPUT_QUEUE_DEPTH: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminAction {
    StartBetting,
    Reset,
}

#[derive(Debug)]
pub struct AdminCommand {
    pub action: AdminAction,
    pub admin_key: String,
    pub wallet_address: String,
    /// Originating subscriber; rejections go only to this queue.
    pub subscriber_id: u64,
}

#[derive(Debug)]
pub enum Input {
    Chat(ChatEvent),
    ChatStatus { connected: bool },
    ChatTerminal,
    Admin(AdminCommand),
    BetNotification(BetSummary),
    Shutdown,
}

#[derive(Clone)]
pub struct GameConfig {
    pub coin: String,
    pub initial_hp: u32,
    pub betting_duration: Duration,
    pub fight_duration: Duration,
    pub fee_percentage: u8,
    pub admin_secret: String,
    pub admin_wallet: String,
}

pub struct Orchestrator {
    cfg: GameConfig,
    state: GameState,
    interpreter: Interpreter,
    ledger: Arc<LedgerClient>,
    hub: Arc<Hub>,
    exporter: ResultExporter,
    published: Arc<ArcSwap<GameSnapshot>>,
    rx: mpsc::Receiver<Input>,
    chat_connected: bool,
}

impl Orchestrator {
    pub fn spawn(
        cfg: GameConfig,
        interpreter: Interpreter,
        ledger: Arc<LedgerClient>,
        hub: Arc<Hub>,
        exporter: ResultExporter,
        published: Arc<ArcSwap<GameSnapshot>>,
    ) -> (mpsc::Sender<Input>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(INPUT_QUEUE_DEPTH);
        let orchestrator = Self {
            state: GameState::new(cfg.initial_hp),
            cfg,
            interpreter,
            ledger,
            hub,
            exporter,
            published,
            rx,
            chat_connected: false,
        };
        orchestrator.publish();
        let task = tokio::spawn(orchestrator.run());
        (tx, task)
    }

    async fn run(mut self) {
        info!("orchestrator started");
        let mut tick = interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                maybe = self.rx.recv() => match maybe {
                    Some(Input::Shutdown) | None => break,
                    Some(input) => self.handle_input(input).await,
                },
                _ = tick.tick() => self.handle_tick().await,
            }
        }
        // cancel timers on the way out; a dead round never resumes
        self.state.betting_end_ms = None;
        self.state.fight_end_ms = None;
        info!("orchestrator stopped");
    }

    async fn handle_input(&mut self, input: Input) {
        match input {
            Input::Chat(ev) => self.handle_chat(ev).await,
            Input::ChatStatus { connected } => {
                self.chat_connected = connected;
                self.publish();
                self.hub
                    .broadcast(ServerEvent::ConnectionStatus { connected });
            }
            Input::ChatTerminal => {
                error!("chat feed terminated after exhausting reconnect attempts");
            }
            Input::Admin(cmd) => self.handle_admin(cmd).await,
            Input::BetNotification(bet) => self.handle_bet_notification(bet),
            Input::Shutdown => unreachable!("handled in run loop"),
        }
    }

    /// Drive phase expiry and the advisory countdown off the 100 ms tick.
    async fn handle_tick(&mut self) {
        let now = crate::now_ms();
        match self.state.phase {
            Phase::Betting => {
                if let Some(end) = self.state.betting_end_ms {
                    if now >= end {
                        self.enter_fighting().await;
                    } else {
                        self.hub.broadcast(ServerEvent::TimerUpdate(TimerPayload {
                            phase: Phase::Betting,
                            time_remaining_ms: end - now,
                        }));
                    }
                }
            }
            Phase::Fighting => {
                if let Some(end) = self.state.fight_end_ms {
                    if now >= end {
                        self.finish_fight().await;
                    } else {
                        self.hub.broadcast(ServerEvent::TimerUpdate(TimerPayload {
                            phase: Phase::Fighting,
                            time_remaining_ms: end - now,
                        }));
                    }
                }
            }
            _ => {}
        }
    }

    // ==================================================================
    // CHAT
    // ==================================================================

    async fn handle_chat(&mut self, ev: ChatEvent) {
        // damage and heal only land during the fight
        if self.state.phase != Phase::Fighting {
            return;
        }
        match self.interpreter.classify(&ev.message) {
            Effect::Ignore => {}
            Effect::Damage => {
                let outcome = self.state.apply_damage(&ev.username, &ev.message, ev.ts_ms);
                self.publish();
                self.broadcast_update();
                if outcome.defeated_now {
                    // the killing blow ends the fight immediately
                    self.finish_fight().await;
                }
            }
            Effect::Heal => {
                self.state.apply_heal(&ev.username, &ev.message, ev.ts_ms);
                self.publish();
                self.broadcast_update();
            }
        }
    }

    fn broadcast_update(&self) {
        let Some(latest) = self.state.chronological.last().cloned() else {
            return;
        };
        self.hub.broadcast(ServerEvent::Update(UpdatePayload {
            boss_hp: self.state.boss_hp,
            max_hp: self.state.max_hp,
            total_hits: self.state.total_hits,
            top_hitters: self.state.top_hitters(3),
            last_hitter: self.state.last_hitter.clone(),
            latest,
            time_remaining_ms: self.state.time_remaining_ms(crate::now_ms()),
        }));
    }

    // ==================================================================
    // ADMIN
    // ==================================================================

    async fn handle_admin(&mut self, cmd: AdminCommand) {
        if !admin_authorized(&self.cfg, &cmd.admin_key, &cmd.wallet_address) {
            warn!(subscriber = cmd.subscriber_id, "rejected admin command");
            self.hub.send_to(
                cmd.subscriber_id,
                ServerEvent::AdminError {
                    message: "invalid admin credentials".into(),
                },
            );
            return;
        }
        match cmd.action {
            AdminAction::StartBetting => match self.state.phase {
                Phase::Idle | Phase::Ended => self.enter_betting(cmd.subscriber_id).await,
                phase => self.hub.send_to(
                    cmd.subscriber_id,
                    ServerEvent::AdminError {
                        message: format!("cannot start betting during {phase}"),
                    },
                ),
            },
            AdminAction::Reset => self.do_reset(),
        }
    }

    fn do_reset(&mut self) {
        let round_id = self.state.round_id;
        info!(round_id, "game reset");
        self.state.reset_to_idle();
        self.publish();
        self.hub
            .broadcast(ServerEvent::GameReset(GameResetPayload { round_id }));
    }

    // ==================================================================
    // PHASE TRANSITIONS
    // ==================================================================

    async fn enter_betting(&mut self, subscriber_id: u64) {
        let round_id = crate::now_ms();
        let pdas = self.ledger.derive_pdas(round_id);
        self.state
            .begin_betting(round_id, pdas.betting_round, pdas.escrow);
        info!(round_id, "initializing betting round");

        match self
            .ledger
            .init_round(
                round_id,
                self.cfg.betting_duration,
                self.cfg.fight_duration,
                self.cfg.initial_hp,
                self.cfg.fee_percentage,
            )
            .await
        {
            Ok(sig) => {
                info!(round_id, signature = %sig, "betting round initialized");
                let remaining = self.cfg.betting_duration.as_millis() as u64;
                self.state.betting_end_ms = Some(crate::now_ms() + remaining);
                self.publish();
                self.hub
                    .broadcast(ServerEvent::PhaseChange(PhaseChangePayload {
                        phase: Phase::Betting,
                        round_id,
                        time_remaining_ms: Some(remaining),
                        message: None,
                    }));
            }
            Err(e) => {
                error!(round_id, error = %e, "init_round failed, reverting to idle");
                self.state.reset_to_idle();
                self.publish();
                self.hub.send_to(
                    subscriber_id,
                    ServerEvent::AdminError {
                        message: format!("failed to initialize betting round: {e}"),
                    },
                );
                self.hub
                    .broadcast(ServerEvent::PhaseChange(PhaseChangePayload {
                        phase: Phase::Idle,
                        round_id: 0,
                        time_remaining_ms: None,
                        message: Some("betting round initialization failed".into()),
                    }));
            }
        }
    }

    async fn enter_fighting(&mut self) {
        let round_id = self.state.round_id;
        self.state.betting_end_ms = None;
        info!(round_id, "betting window closed, starting fight phase");

        match self.ledger.start_fight(round_id).await {
            Ok(_) => {
                let now = crate::now_ms();
                let remaining = self.cfg.fight_duration.as_millis() as u64;
                self.state.phase = Phase::Fighting;
                self.state.fight_started_ms = Some(now);
                self.state.fight_end_ms = Some(now + remaining);
                self.refresh_bets().await;
                self.publish();
                self.hub
                    .broadcast(ServerEvent::PhaseChange(PhaseChangePayload {
                        phase: Phase::Fighting,
                        round_id,
                        time_remaining_ms: Some(remaining),
                        message: None,
                    }));
                self.broadcast_betting_update();
            }
            Err(e) => {
                error!(round_id, error = %e, "start_fight failed, reverting to idle");
                self.state.reset_to_idle();
                self.publish();
                self.hub
                    .broadcast(ServerEvent::PhaseChange(PhaseChangePayload {
                        phase: Phase::Idle,
                        round_id: 0,
                        time_remaining_ms: None,
                        message: Some(format!("failed to start fight phase: {e}")),
                    }));
            }
        }
    }

    /// Mirror on-chain bet state for display. Totals come from the round
    /// account, the per-wallet board from the bet scan; neither is
    /// authoritative for payouts, so failures here only degrade the overlay.
    async fn refresh_bets(&mut self) {
        let round_id = self.state.round_id;
        match self.ledger.fetch_round(round_id).await {
            Ok(round) => {
                self.state.total_death_bets = round.total_death_bets;
                self.state.total_survival_bets = round.total_survival_bets;
            }
            Err(e) => warn!(round_id, error = %e, "could not refresh betting totals"),
        }
        match self.ledger.scan_bets(round_id).await {
            Ok(bets) => {
                let summaries = bets
                    .into_iter()
                    .map(|(_, b)| BetSummary {
                        wallet: b.bettor.to_string(),
                        username: b.username,
                        amount_lamports: b.amount_lamports,
                        prediction: b.prediction,
                        ts: b.timestamp,
                    })
                    .collect();
                self.state.set_on_chain_bets(summaries);
            }
            Err(e) => warn!(round_id, error = %e, "could not scan bet accounts"),
        }
    }

    fn broadcast_betting_update(&self) {
        self.hub
            .broadcast(ServerEvent::BettingUpdate(BettingUpdatePayload {
                round_id: self.state.round_id,
                total_death_bets: self.state.total_death_bets,
                total_survival_bets: self.state.total_survival_bets,
                bets: self.state.bets_sorted(),
            }));
    }

    fn handle_bet_notification(&mut self, bet: BetSummary) {
        // client-reported mirror for UI liveness; authoritative totals are
        // refreshed from chain on fight start
        info!(wallet = %bet.wallet, amount = bet.amount_lamports, "bet notification");
        self.state.on_chain_bets.insert(bet.wallet.clone(), bet);
        self.publish();
        self.broadcast_betting_update();
    }

    async fn finish_fight(&mut self) {
        let round_id = self.state.round_id;
        self.state.fight_end_ms = None;
        let boss_defeated = self.state.boss_hp == 0;
        info!(round_id, boss_defeated, final_hp = self.state.boss_hp, "ending fight");

        if let Err(e) = self.ledger.end_fight(round_id, self.state.boss_hp).await {
            // the chain still thinks the fight is running; settlement is
            // impossible, so hold Fighting (timer cancelled) for admin reset
            error!(round_id, error = %e, "end_fight failed");
            self.publish();
            self.hub
                .broadcast(ServerEvent::PhaseChange(PhaseChangePayload {
                    phase: Phase::Fighting,
                    round_id,
                    time_remaining_ms: None,
                    message: Some("failed to end fight on-chain".into()),
                }));
            return;
        }

        let settlement_result = settlement::settle_round(self.ledger.as_ref(), round_id).await;

        self.state.phase = Phase::Ended;
        let results = self
            .state
            .build_results(&self.cfg.coin, boss_defeated, crate::now_ms());
        self.publish();
        self.hub
            .broadcast(ServerEvent::PhaseChange(PhaseChangePayload {
                phase: Phase::Ended,
                round_id,
                time_remaining_ms: None,
                message: None,
            }));
        self.hub.broadcast(ServerEvent::FightEnded(results.clone()));
        match settlement_result {
            Ok(summary) => self.hub.broadcast(ServerEvent::PayoutsProcessed(summary)),
            Err(e) => error!(round_id, error = %e, "settlement failed"),
        }

        let exporter = self.exporter.clone();
        tokio::task::spawn_blocking(move || match exporter.export(&results) {
            Ok((json_path, _)) => info!(path = %json_path.display(), "results exported"),
            Err(e) => error!(error = %e, "result export failed"),
        });
    }

    /// Store the fresh snapshot. Always runs before the events reflecting a
    /// mutation are broadcast: a subscriber joining between the store and the
    /// broadcast gets the newer snapshot plus a duplicate event, never a gap.
    fn publish(&self) {
        self.published.store(Arc::new(
            self.state.snapshot(self.chat_connected, crate::now_ms()),
        ));
    }
}

fn admin_authorized(cfg: &GameConfig, admin_key: &str, wallet_address: &str) -> bool {
    admin_key == cfg.admin_secret && wallet_address == cfg.admin_wallet
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::pubkey::Pubkey;
    use solana_sdk::signature::Keypair;

    fn test_config() -> GameConfig {
        GameConfig {
            coin: "TEST".into(),
            initial_hp: 3,
            betting_duration: Duration::from_secs(1),
            fight_duration: Duration::from_secs(5),
            fee_percentage: 5,
            admin_secret: "s3cret".into(),
            admin_wallet: "AdminWallet111".into(),
        }
    }

    fn test_orchestrator() -> (Orchestrator, Arc<Hub>, mpsc::Sender<Input>) {
        let cfg = test_config();
        let published = Arc::new(ArcSwap::from_pointee(
            GameState::new(cfg.initial_hp).snapshot(false, 0),
        ));
        let hub = Hub::new(published.clone());
        let (tx, rx) = mpsc::channel(16);
        let ledger = Arc::new(LedgerClient::new(
            "http://127.0.0.1:1",
            Pubkey::new_unique(),
            Keypair::new(),
            Pubkey::new_unique(),
        ));
        let orchestrator = Orchestrator {
            state: GameState::new(cfg.initial_hp),
            interpreter: Interpreter::new("HIT", "HEAL").unwrap(),
            cfg,
            ledger,
            hub: hub.clone(),
            exporter: ResultExporter::new(std::env::temp_dir()),
            published,
            rx,
            chat_connected: false,
        };
        (orchestrator, hub, tx)
    }

    fn chat(user: &str, msg: &str, ts: u64) -> ChatEvent {
        ChatEvent {
            username: user.into(),
            message: msg.into(),
            ts_ms: ts,
        }
    }

    #[tokio::test]
    async fn chat_outside_fighting_changes_nothing() {
        let (mut orch, _hub, _tx) = test_orchestrator();
        orch.handle_chat(chat("alice", "HIT", 1)).await;
        assert_eq!(orch.state.boss_hp, 3);
        assert_eq!(orch.state.total_hits, 0);
    }

    #[tokio::test]
    async fn damage_and_heal_flow_during_fight() {
        let (mut orch, hub, _tx) = test_orchestrator();
        orch.state
            .begin_betting(1, Pubkey::new_unique(), Pubkey::new_unique());
        orch.state.phase = Phase::Fighting;
        let (_id, mut rx) = hub.subscribe();
        let _ = rx.recv().await; // snapshot

        orch.handle_chat(chat("alice", "HIT", 1)).await;
        orch.handle_chat(chat("mallory", "HIT and HEAL", 2)).await;
        orch.handle_chat(chat("eve", "HEAL", 3)).await;

        assert_eq!(orch.state.boss_hp, 3, "damage then ambiguous then heal");
        assert_eq!(orch.state.total_hits, 1);
        assert_eq!(orch.state.last_hitter.as_deref(), Some("alice"));

        // exactly two updates: the ambiguous message produced none
        match rx.recv().await {
            Some(ServerEvent::Update(u)) => assert_eq!(u.boss_hp, 2),
            other => panic!("expected update, got {other:?}"),
        }
        match rx.recv().await {
            Some(ServerEvent::Update(u)) => assert_eq!(u.boss_hp, 3),
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn snapshot_is_republished_after_mutation() {
        let (mut orch, _hub, _tx) = test_orchestrator();
        orch.state
            .begin_betting(1, Pubkey::new_unique(), Pubkey::new_unique());
        orch.state.phase = Phase::Fighting;
        orch.handle_chat(chat("alice", "hit", 1)).await;
        assert_eq!(orch.published.load().boss_hp, 2);
        assert_eq!(orch.published.load().total_hits, 1);
    }

    #[tokio::test]
    async fn bad_admin_key_is_rejected_privately() {
        let (mut orch, hub, _tx) = test_orchestrator();
        let (id, mut rx) = hub.subscribe();
        let _ = rx.recv().await; // snapshot
        orch.handle_admin(AdminCommand {
            action: AdminAction::Reset,
            admin_key: "wrong".into(),
            wallet_address: "AdminWallet111".into(),
            subscriber_id: id,
        })
        .await;
        match rx.recv().await {
            Some(ServerEvent::AdminError { message }) => {
                assert!(message.contains("invalid admin credentials"))
            }
            other => panic!("expected admin error, got {other:?}"),
        }
        assert_eq!(orch.state.phase, Phase::Idle);
    }

    #[tokio::test]
    async fn admin_wallet_must_match_too() {
        let cfg = test_config();
        assert!(admin_authorized(&cfg, "s3cret", "AdminWallet111"));
        assert!(!admin_authorized(&cfg, "s3cret", "OtherWallet"));
        assert!(!admin_authorized(&cfg, "nope", "AdminWallet111"));
    }

    #[tokio::test]
    async fn reset_clears_round_and_broadcasts() {
        let (mut orch, hub, _tx) = test_orchestrator();
        orch.state
            .begin_betting(7, Pubkey::new_unique(), Pubkey::new_unique());
        orch.state.phase = Phase::Fighting;
        orch.state.apply_damage("alice", "HIT", 1);
        let (_id, mut rx) = hub.subscribe();
        let _ = rx.recv().await; // snapshot

        orch.handle_admin(AdminCommand {
            action: AdminAction::Reset,
            admin_key: "s3cret".into(),
            wallet_address: "AdminWallet111".into(),
            subscriber_id: 0,
        })
        .await;

        assert_eq!(orch.state.phase, Phase::Idle);
        assert_eq!(orch.state.round_id, 0);
        assert!(orch.state.user_hits.is_empty());
        match rx.recv().await {
            Some(ServerEvent::GameReset(p)) => assert_eq!(p.round_id, 7),
            other => panic!("expected game_reset, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn start_betting_rejected_mid_fight() {
        let (mut orch, hub, _tx) = test_orchestrator();
        orch.state
            .begin_betting(7, Pubkey::new_unique(), Pubkey::new_unique());
        orch.state.phase = Phase::Fighting;
        let (id, mut rx) = hub.subscribe();
        let _ = rx.recv().await;

        orch.handle_admin(AdminCommand {
            action: AdminAction::StartBetting,
            admin_key: "s3cret".into(),
            wallet_address: "AdminWallet111".into(),
            subscriber_id: id,
        })
        .await;

        match rx.recv().await {
            Some(ServerEvent::AdminError { message }) => {
                assert!(message.contains("fighting"))
            }
            other => panic!("expected admin error, got {other:?}"),
        }
        assert_eq!(orch.state.phase, Phase::Fighting);
    }

    #[tokio::test]
    async fn bet_notification_updates_board_not_totals() {
        let (mut orch, hub, _tx) = test_orchestrator();
        orch.state
            .begin_betting(7, Pubkey::new_unique(), Pubkey::new_unique());
        let (_id, mut rx) = hub.subscribe();
        let _ = rx.recv().await;

        orch.handle_bet_notification(BetSummary {
            wallet: "W1".into(),
            username: "alice".into(),
            amount_lamports: 1_000_000,
            prediction: crate::ledger::accounts::Prediction::Death,
            ts: 1,
        });

        assert_eq!(orch.state.on_chain_bets.len(), 1);
        assert_eq!(orch.state.total_death_bets, 0, "totals stay on-chain authoritative");
        match rx.recv().await {
            Some(ServerEvent::BettingUpdate(p)) => {
                assert_eq!(p.bets.len(), 1);
                assert_eq!(p.total_death_bets, 0);
            }
            other => panic!("expected betting_update, got {other:?}"),
        }
    }
}
