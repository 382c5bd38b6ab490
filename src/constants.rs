//! Shared string constants: result keys, cache keys, well-known class names

/// Keys of the nested result mapping produced by a run
pub mod result_keys {
    pub const VALIDATION_METRICS: &str = "validation-metrics";
    pub const TRAIN_METRICS: &str = "train-metrics";
    pub const TEST_METRICS: &str = "test-metrics";
    pub const TRAIN_FROM_FULL_METRICS: &str = "train-from-full-metrics";
    pub const CV_METRICS: &str = "cv-metrics";
    pub const CV_MEAN_METRICS: &str = "cv-mean-metrics";
    pub const MODELS: &str = "models";
    pub const TRAIN_PERCENT: &str = "train-percent";
    pub const TRAIN_VALIDATE_STATUS: &str = "train-validate-status";
    pub const TRAIN_FULL_STATUS: &str = "train-full-status";
    pub const CV_STATUS: &str = "cv-status";
    pub const WALL_TIME: &str = "wall-time";
}

/// Timing entries attached to every metric map
pub mod timing {
    pub const FIT_TIME: &str = "fit_time";
    pub const PREDICT_TIME: &str = "predict_time";
    pub const TRAIN_TIME: &str = "train_time";

    pub const ALL: [&str; 3] = [FIT_TIME, PREDICT_TIME, TRAIN_TIME];
}

/// Field names used as keys in a dataset's cache store
pub mod cache_keys {
    pub const X: &str = "X";
    pub const Y: &str = "y";
    pub const SAMPLE_WEIGHT: &str = "sample_weight";
    pub const X_VALID: &str = "X_valid";
    pub const Y_VALID: &str = "y_valid";
    pub const SAMPLE_WEIGHT_VALID: &str = "sample_weight_valid";
    pub const X_TEST: &str = "X_test";
    pub const Y_TEST: &str = "y_test";
    pub const SAMPLE_WEIGHT_TEST: &str = "sample_weight_test";
    pub const X_RAW: &str = "X_raw";
    pub const Y_RAW: &str = "y_raw";
    pub const CLASS_LABELS: &str = "class_labels";
    pub const TRAIN_INDICES: &str = "train indices";
    pub const VALID_INDICES: &str = "valid indices";
    pub const TEST_INDICES: &str = "test indices";
    pub const FEATURIZED_TRAIN: &str = "featurized train";
    pub const FEATURIZED_VALID: &str = "featurized valid";
    pub const FEATURIZED_TEST: &str = "featurized test";
    pub const TRAIN_CV_SPLITS: &str = "train CV splits";
    pub const FEATURIZED_TRAIN_CV_SPLITS: &str = "featurized train CV splits";
    pub const TRANSFORMERS: &str = "transformers";
    pub const TRAINING_TYPE: &str = "training_type";
    pub const TIMESERIES: &str = "timeseries";
    pub const DATASET_CACHED_KEYS: &str = "dataset_cached_keys";

    /// Heavy fields, in the order they are written to the cache
    pub const DATA_FIELDS: [&str; 23] = [
        X,
        Y,
        SAMPLE_WEIGHT,
        X_VALID,
        Y_VALID,
        SAMPLE_WEIGHT_VALID,
        X_TEST,
        Y_TEST,
        SAMPLE_WEIGHT_TEST,
        X_RAW,
        Y_RAW,
        CLASS_LABELS,
        TRAIN_INDICES,
        VALID_INDICES,
        TEST_INDICES,
        FEATURIZED_TRAIN,
        FEATURIZED_VALID,
        FEATURIZED_TEST,
        TRAIN_CV_SPLITS,
        FEATURIZED_TRAIN_CV_SPLITS,
        TRANSFORMERS,
        TRAINING_TYPE,
        TIMESERIES,
    ];
}

/// Names of the dataset transformers
pub mod transformer_names {
    pub const X_TRANSFORMER: &str = "x_transformer";
    pub const Y_TRANSFORMER: &str = "y_transformer";
    pub const TIMESERIES_TRANSFORMER: &str = "timeseries_transformer";
    pub const PREPROCESSOR_STEP: &str = "datatransformer";
}

/// Class names that receive special handling
pub mod model_names {
    pub const AUTO_ARIMA: &str = "AutoArima";
    pub const PROPHET: &str = "Prophet";
    pub const EXPONENTIAL_SMOOTHING: &str = "ExponentialSmoothing";
    pub const VOTING_ENSEMBLE: &str = "VotingEnsemble";
    pub const STACK_ENSEMBLE: &str = "StackEnsemble";

    /// Classical forecasters, loaded from the timeseries module and exempt
    /// from the imputed-target row filter
    pub const CLASSICAL_TIMESERIES: [&str; 3] = [AUTO_ARIMA, PROPHET, EXPONENTIAL_SMOOTHING];

    /// Ensembles exempt from the imputed-target row filter
    pub const ENSEMBLES: [&str; 2] = [VOTING_ENSEMBLE, STACK_ENSEMBLE];

    /// Learners that consume categorical columns natively
    pub const CATEGORICAL_AWARE: [&str; 2] = ["DecisionTreeClassifier", "DecisionTreeRegressor"];

    pub fn is_classical_timeseries(class_name: &str) -> bool {
        CLASSICAL_TIMESERIES.contains(&class_name)
    }

    pub fn is_ensemble(class_name: &str) -> bool {
        ENSEMBLES.contains(&class_name)
    }

    pub fn is_categorical_aware(class_name: &str) -> bool {
        CATEGORICAL_AWARE.contains(&class_name)
    }
}

/// Key under which timeseries estimators receive their parameters
pub const TIMESERIES_PARAM_DICT: &str = "timeseries_param_dict";

/// Environment variable naming the child-side log file
pub const CHILD_LOG_FILE_ENV: &str = "KOLOSAL_RUNNER_LOG_FILE";

/// Exit code Windows reports when a job object's CPU quota is exceeded
pub const WINDOWS_CPU_TIMEOUT_CODE: u32 = 0xC000_0044;

/// Default log filter for the binaries
pub const DEFAULT_LOG_FILTER: &str = "kolosal_runner=info";

/// Environment variable overriding the spawn server location
pub const SPAWN_SERVER_ENV: &str = "KOLOSAL_SPAWN_SERVER";

/// File name of the spawn server binary, without platform suffix
pub const SPAWN_SERVER_BIN: &str = "kolosal-spawn-server";

/// Environment variables read by [`crate::config::RunnerSettings::from_env`]
pub mod env_vars {
    pub const WORKING_DIR: &str = "KOLOSAL_RUNNER_WORKING_DIR";
    pub const DISABLE_LIMITS: &str = "KOLOSAL_RUNNER_DISABLE_LIMITS";
    pub const SUBSAMPLE_STRATEGY: &str = "KOLOSAL_RUNNER_SUBSAMPLE_STRATEGY";
    pub const LOG_VERBOSITY: &str = "KOLOSAL_RUNNER_LOG_VERBOSITY";
}
